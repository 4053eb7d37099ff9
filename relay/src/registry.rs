//! Channel registry for Burrow Relay
//!
//! Request handling only asks the registry to `route` a request. The
//! single-slot implementation always answers with the most recently
//! attached channel; a keyed implementation can replace it later.

use std::sync::RwLock;

use crate::channel::{ChannelHandle, ChannelId};

/// What a registry may use to pick a channel
#[derive(Debug, Clone, Copy)]
pub struct RouteKey<'a> {
    pub host: Option<&'a str>,
    pub path: &'a str,
}

pub trait ChannelRegistry: Send + Sync + 'static {
    /// Register a channel, returning the one it replaced
    fn register(&self, channel: ChannelHandle) -> Option<ChannelHandle>;

    /// Remove a channel if it is still registered. A stale id never
    /// removes a newer channel.
    fn deregister(&self, id: ChannelId) -> bool;

    fn route(&self, key: &RouteKey<'_>) -> Option<ChannelHandle>;
}

/// At most one attached channel; the newest wins
#[derive(Default)]
pub struct SingleSlotRegistry {
    slot: RwLock<Option<ChannelHandle>>,
}

impl SingleSlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelRegistry for SingleSlotRegistry {
    fn register(&self, channel: ChannelHandle) -> Option<ChannelHandle> {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        slot.replace(channel)
    }

    fn deregister(&self, id: ChannelId) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(ChannelHandle::id) == Some(id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn route(&self, _key: &RouteKey<'_>) -> Option<ChannelHandle> {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
