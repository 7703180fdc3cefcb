use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use taskmesh_storage::{KvStore, key_suffix, namespaced_key};
use taskmesh_types::{MeshError, PeerId, Recipient, Result, WorkerState};

const WORKER_NAMESPACE: &str = "worker";

/// Worker state keyed by peer id, written through to the shared store.
///
/// Each worker has its own async mutex, so two messages about the same
/// worker apply one after the other while different workers never contend.
pub struct WorkerRegistry {
    kv: Arc<dyn KvStore>,
    workers: DashMap<PeerId, Arc<Mutex<WorkerState>>>,
}

impl WorkerRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            workers: DashMap::new(),
        }
    }

    /// Load persisted worker states. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize> {
        let prefix = format!("{WORKER_NAMESPACE}/");
        let mut restored = 0;
        for key in self.kv.keys_with_prefix(prefix.as_bytes()).await? {
            if key_suffix(WORKER_NAMESPACE, &key).is_none() {
                continue;
            }
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let state: WorkerState = serde_json::from_slice(&raw)?;
            self.workers
                .insert(state.peer_id.clone(), Arc::new(Mutex::new(state)));
            restored += 1;
        }
        tracing::info!(workers = restored, "worker registry restored");
        Ok(restored)
    }

    /// Create the worker on first contact, otherwise refresh its recipient
    /// and activity timestamp.
    pub async fn register(&self, peer: &PeerId, recipient: Recipient) -> Result<WorkerState> {
        let slot = self
            .workers
            .entry(peer.clone())
            .or_insert_with(|| {
                tracing::info!(worker = %peer, "new worker");
                Arc::new(Mutex::new(WorkerState::new(peer.clone(), recipient)))
            })
            .clone();
        let mut guard = slot.lock().await;
        let mut next = guard.clone();
        next.recipient = recipient;
        next.touch();
        self.persist(&next).await?;
        *guard = next.clone();
        Ok(next)
    }

    pub async fn get(&self, peer: &PeerId) -> Option<WorkerState> {
        let slot = self.workers.get(peer).map(|s| s.value().clone())?;
        let state = slot.lock().await.clone();
        Some(state)
    }

    /// Apply `f` to a worker under its lock and persist the result.
    pub async fn update<F>(&self, peer: &PeerId, f: F) -> Result<WorkerState>
    where
        F: FnOnce(&mut WorkerState),
    {
        let slot = self
            .workers
            .get(peer)
            .map(|s| s.value().clone())
            .ok_or_else(|| MeshError::WorkerNotFound(peer.clone()))?;
        let mut guard = slot.lock().await;
        let mut next = guard.clone();
        f(&mut next);
        self.persist(&next).await?;
        *guard = next.clone();
        Ok(next)
    }

    pub async fn is_banned(&self, peer: &PeerId) -> bool {
        self.get(peer).await.is_some_and(|w| w.banned)
    }

    pub async fn set_banned(&self, peer: &PeerId, banned: bool) -> Result<WorkerState> {
        self.update(peer, |w| w.banned = banned).await
    }

    pub async fn record_payout(
        &self,
        peer: &PeerId,
        nonce: u64,
        at: DateTime<Utc>,
    ) -> Result<WorkerState> {
        self.update(peer, |w| w.record_payout(nonce, at)).await
    }

    pub async fn all(&self) -> Vec<WorkerState> {
        let slots: Vec<Arc<Mutex<WorkerState>>> =
            self.workers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out
    }

    async fn persist(&self, state: &WorkerState) -> Result<()> {
        let raw = serde_json::to_vec(state)?;
        self.kv
            .put(&namespaced_key(WORKER_NAMESPACE, &state.peer_id), raw)
            .await
    }
}
