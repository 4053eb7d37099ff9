//! Pending request table
//!
//! Maps correlation ids to the sink of a public request waiting on the
//! bridge. Every entry ends exactly once: delivered, failed with its
//! channel, expired by the reaper, or cancelled by its own handler.

use burrow_shared::{RequestId, ResponseEnvelope};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::ChannelId;

/// How a pending request was resolved
#[derive(Debug)]
pub enum Outcome {
    Delivered(ResponseEnvelope),
    /// The channel that carried the request closed or was superseded
    ChannelClosed,
    TimedOut,
}

struct Entry {
    channel: ChannelId,
    sink: oneshot::Sender<Outcome>,
    deadline: Instant,
}

#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<RequestId, Entry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh correlation id owned by `channel`
    pub fn open(&self, channel: ChannelId, timeout: Duration) -> (RequestId, oneshot::Receiver<Outcome>) {
        let (sink, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        loop {
            let id = RequestId::generate();
            if let MapEntry::Vacant(slot) = self.entries.entry(id.clone()) {
                slot.insert(Entry {
                    channel,
                    sink,
                    deadline,
                });
                return (id, rx);
            }
        }
    }

    /// Resolve the entry matching the response id. Unknown, late, or
    /// duplicate ids return false and are otherwise ignored.
    pub fn complete(&self, response: ResponseEnvelope) -> bool {
        match self.entries.remove(&response.id) {
            Some((_, entry)) => {
                let _ = entry.sink.send(Outcome::Delivered(response));
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every entry carried by `channel`
    pub fn fail_channel(&self, channel: ChannelId) -> usize {
        self.resolve_where(|entry| entry.channel == channel, || Outcome::ChannelClosed)
    }

    /// Fail every entry whose deadline has passed
    pub fn reap_expired(&self, now: Instant) -> usize {
        self.resolve_where(|entry| entry.deadline <= now, || Outcome::TimedOut)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cancel `id` when the returned guard drops, so a public client that
    /// hangs up does not leave its entry behind
    pub fn guard(self: &Arc<Self>, id: RequestId) -> PendingGuard {
        PendingGuard {
            table: Arc::clone(self),
            id,
        }
    }

    fn resolve_where(&self, matches: impl Fn(&Entry) -> bool, outcome: impl Fn() -> Outcome) -> usize {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|e| matches(e.value()))
            .map(|e| e.key().clone())
            .collect();

        let mut resolved = 0;
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.sink.send(outcome());
                resolved += 1;
            }
        }
        resolved
    }
}

pub struct PendingGuard {
    table: Arc<PendingTable>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.cancel(&self.id) {
            debug!("Request {} abandoned before completion", self.id);
        }
    }
}

/// Periodically fail pending requests that outlived their deadline
pub fn spawn_reaper(table: Arc<PendingTable>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = table.reap_expired(Instant::now());
            if expired > 0 {
                warn!("Timed out {} pending request(s)", expired);
            }
        }
    })
}
