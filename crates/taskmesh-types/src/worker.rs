use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PeerId, Recipient};

/// Per-worker task bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounters {
    pub total_tasks: u64,
    pub tasks_completed: u64,
    pub tasks_accepted: u64,
    pub tasks_rejected: u64,
}

/// What the manager knows about a worker. Never deleted, only banned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub peer_id: PeerId,
    pub recipient: Recipient,
    /// Highest payment nonce settled for this worker.
    pub nonce: u64,
    pub last_payout: Option<DateTime<Utc>>,
    pub counters: WorkerCounters,
    pub last_activity: DateTime<Utc>,
    pub banned: bool,
}

impl WorkerState {
    pub fn new(peer_id: PeerId, recipient: Recipient) -> Self {
        Self {
            peer_id,
            recipient,
            nonce: 0,
            last_payout: None,
            counters: WorkerCounters::default(),
            last_activity: Utc::now(),
            banned: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn record_accepted(&mut self) {
        self.counters.total_tasks += 1;
        self.counters.tasks_accepted += 1;
        self.touch();
    }

    pub fn record_completed(&mut self) {
        self.counters.tasks_completed += 1;
        self.touch();
    }

    pub fn record_rejected(&mut self) {
        self.counters.tasks_rejected += 1;
        self.touch();
    }

    /// Nonces only move forward; stale payout notifications are ignored.
    pub fn record_payout(&mut self, nonce: u64, at: DateTime<Utc>) {
        if nonce > self.nonce {
            self.nonce = nonce;
            self.last_payout = Some(at);
        }
    }
}
