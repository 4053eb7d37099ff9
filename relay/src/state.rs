//! Relay-wide state shared by all handlers.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::pending::{self, PendingTable};
use crate::registry::{ChannelRegistry, SingleSlotRegistry};

#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<dyn ChannelRegistry>,
    pub pending: Arc<PendingTable>,
    pub config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_registry(config, Arc::new(SingleSlotRegistry::new()))
    }

    pub fn with_registry(config: RelayConfig, registry: Arc<dyn ChannelRegistry>) -> Self {
        Self {
            registry,
            pending: Arc::new(PendingTable::new()),
            config: Arc::new(config),
        }
    }

    /// Start the task that expires requests past `request_timeout`
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let period = (self.config.request_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        pending::spawn_reaper(self.pending.clone(), period)
    }
}
