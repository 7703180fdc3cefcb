use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use taskmesh_storage::{KvStore, key_suffix, namespaced_key};
use taskmesh_types::{MeshError, PaymentCredit, PeerId, Recipient, Result, TaskId};

const LEDGER_NAMESPACE: &str = "ledger";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkerAccount {
    last_nonce: u64,
    pending: Vec<PaymentCredit>,
    /// Flushed for settlement but not yet confirmed as handed off.
    #[serde(default)]
    inflight: Vec<PaymentCredit>,
    /// Tasks that already produced a credit.
    #[serde(default)]
    credited: BTreeSet<TaskId>,
}

impl WorkerAccount {
    /// Merge credits into `pending` by nonce, keeping it sorted.
    fn merge_pending(&mut self, credits: impl IntoIterator<Item = PaymentCredit>) -> usize {
        let before = self.pending.len();
        for credit in credits {
            if !self.pending.iter().any(|c| c.nonce == credit.nonce) {
                self.pending.push(credit);
            }
        }
        self.pending.sort_by_key(|c| c.nonce);
        self.pending.len() - before
    }
}

/// Per-worker payment credits and nonce counters.
///
/// The ledger is the authority for payment nonces: each worker's account
/// sits behind its own async mutex, and nonce allocation, persistence and
/// commit all happen while that lock is held, so concurrent completions for
/// one worker always produce a contiguous increasing run.
///
/// Flushed credits stay on disk as in flight until [`PaymentLedger::confirm`];
/// reopening the ledger turns anything still in flight back into pending.
pub struct PaymentLedger {
    kv: Arc<dyn KvStore>,
    accounts: DashMap<PeerId, Arc<Mutex<WorkerAccount>>>,
    pending: AtomicUsize,
}

impl PaymentLedger {
    /// Open the ledger, restoring accounts persisted in `kv`.
    pub async fn open(kv: Arc<dyn KvStore>) -> Result<Self> {
        let ledger = Self {
            kv,
            accounts: DashMap::new(),
            pending: AtomicUsize::new(0),
        };
        let prefix = format!("{LEDGER_NAMESPACE}/");
        for key in ledger.kv.keys_with_prefix(prefix.as_bytes()).await? {
            let Some(peer) = key_suffix(LEDGER_NAMESPACE, &key) else {
                continue;
            };
            let Some(raw) = ledger.kv.get(&key).await? else {
                continue;
            };
            let mut account: WorkerAccount = serde_json::from_slice(&raw)?;
            let inflight = std::mem::take(&mut account.inflight);
            if !inflight.is_empty() {
                tracing::warn!(worker = peer, credits = inflight.len(), "unsettled credits restored to pending");
                account.merge_pending(inflight);
            }
            ledger
                .pending
                .fetch_add(account.pending.len(), Ordering::SeqCst);
            ledger
                .accounts
                .insert(PeerId::new(peer), Arc::new(Mutex::new(account)));
        }
        tracing::info!(
            accounts = ledger.accounts.len(),
            pending = ledger.pending_total(),
            "payment ledger opened"
        );
        Ok(ledger)
    }

    /// Issue a credit for `amount` under the worker's next nonce.
    pub async fn issue(
        &self,
        worker: &PeerId,
        recipient: Recipient,
        amount: u64,
    ) -> Result<PaymentCredit> {
        let slot = self.account(worker);
        let mut account = slot.lock().await;
        self.allocate(worker, &mut account, recipient, amount, None)
            .await
    }

    /// Issue the credit owed for `task_id`, at most once per task.
    /// Returns `None` when the task was already credited.
    pub async fn issue_for(
        &self,
        task_id: TaskId,
        worker: &PeerId,
        recipient: Recipient,
        amount: u64,
    ) -> Result<Option<PaymentCredit>> {
        let slot = self.account(worker);
        let mut account = slot.lock().await;
        if account.credited.contains(&task_id) {
            tracing::debug!(%task_id, worker = %worker, "task already credited");
            return Ok(None);
        }
        self.allocate(worker, &mut account, recipient, amount, Some(task_id))
            .await
            .map(Some)
    }

    pub async fn is_credited(&self, worker: &PeerId, task_id: TaskId) -> bool {
        match self.accounts.get(worker).map(|s| s.value().clone()) {
            Some(slot) => slot.lock().await.credited.contains(&task_id),
            None => false,
        }
    }

    async fn allocate(
        &self,
        worker: &PeerId,
        account: &mut WorkerAccount,
        recipient: Recipient,
        amount: u64,
        task_id: Option<TaskId>,
    ) -> Result<PaymentCredit> {
        let nonce = account
            .last_nonce
            .checked_add(1)
            .ok_or_else(|| MeshError::Internal(format!("nonce space exhausted for {worker}")))?;

        let credit = PaymentCredit::new(nonce, recipient, amount);
        let mut next = account.clone();
        next.last_nonce = nonce;
        next.pending.push(credit);
        if let Some(task_id) = task_id {
            next.credited.insert(task_id);
        }
        self.persist(worker, &next).await?;
        *account = next;
        self.pending.fetch_add(1, Ordering::SeqCst);

        tracing::info!(worker = %worker, task_id = ?task_id, nonce, amount, "payment credit issued");
        Ok(credit)
    }

    /// Raise the worker's nonce floor. Never lowers it.
    pub async fn seed_nonce(&self, worker: &PeerId, last_nonce: u64) -> Result<()> {
        let slot = self.account(worker);
        let mut account = slot.lock().await;
        if last_nonce <= account.last_nonce {
            return Ok(());
        }
        let mut next = account.clone();
        next.last_nonce = last_nonce;
        self.persist(worker, &next).await?;
        *account = next;
        Ok(())
    }

    pub async fn last_nonce(&self, worker: &PeerId) -> Option<u64> {
        let slot = self.accounts.get(worker).map(|s| s.value().clone())?;
        let nonce = slot.lock().await.last_nonce;
        Some(nonce)
    }

    /// Return the worker's pending credits, oldest first, and mark them in
    /// flight.
    pub async fn flush(&self, worker: &PeerId) -> Result<Vec<PaymentCredit>> {
        let Some(slot) = self.accounts.get(worker).map(|s| s.value().clone()) else {
            return Ok(Vec::new());
        };
        let mut account = slot.lock().await;
        if account.pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut next = account.clone();
        let credits = std::mem::take(&mut next.pending);
        next.inflight.extend(credits.iter().copied());
        self.persist(worker, &next).await?;
        *account = next;
        self.pending.fetch_sub(credits.len(), Ordering::SeqCst);
        tracing::debug!(worker = %worker, credits = credits.len(), "credits flushed");
        Ok(credits)
    }

    /// Flush every worker with pending credits.
    pub async fn flush_all(&self) -> Result<Vec<(PeerId, Vec<PaymentCredit>)>> {
        let mut workers: Vec<PeerId> = self.accounts.iter().map(|e| e.key().clone()).collect();
        workers.sort();
        let mut out = Vec::new();
        for worker in workers {
            let credits = self.flush(&worker).await?;
            if !credits.is_empty() {
                out.push((worker, credits));
            }
        }
        Ok(out)
    }

    /// Forget in-flight credits whose batch was handed to settlement.
    pub async fn confirm(&self, worker: &PeerId, credits: &[PaymentCredit]) -> Result<()> {
        if credits.is_empty() {
            return Ok(());
        }
        let slot = self.account(worker);
        let mut account = slot.lock().await;
        let mut next = account.clone();
        next.inflight
            .retain(|c| !credits.iter().any(|done| done.nonce == c.nonce));
        self.persist(worker, &next).await?;
        *account = next;
        tracing::debug!(worker = %worker, credits = credits.len(), "credits settled");
        Ok(())
    }

    /// Put credits back after a failed settlement. They keep their nonces.
    pub async fn requeue(&self, worker: &PeerId, credits: Vec<PaymentCredit>) -> Result<()> {
        if credits.is_empty() {
            return Ok(());
        }
        let slot = self.account(worker);
        let mut account = slot.lock().await;
        let mut next = account.clone();
        next.inflight
            .retain(|c| !credits.iter().any(|back| back.nonce == c.nonce));
        let added = next.merge_pending(credits);
        next.last_nonce = next
            .pending
            .last()
            .map_or(next.last_nonce, |c| c.nonce.max(next.last_nonce));
        self.persist(worker, &next).await?;
        *account = next;
        self.pending.fetch_add(added, Ordering::SeqCst);
        tracing::warn!(worker = %worker, credits = added, "credits returned to ledger");
        Ok(())
    }

    pub fn pending_total(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn pending_for(&self, worker: &PeerId) -> usize {
        match self.accounts.get(worker).map(|s| s.value().clone()) {
            Some(slot) => slot.lock().await.pending.len(),
            None => 0,
        }
    }

    pub async fn inflight_for(&self, worker: &PeerId) -> usize {
        match self.accounts.get(worker).map(|s| s.value().clone()) {
            Some(slot) => slot.lock().await.inflight.len(),
            None => 0,
        }
    }

    fn account(&self, worker: &PeerId) -> Arc<Mutex<WorkerAccount>> {
        self.accounts.entry(worker.clone()).or_default().clone()
    }

    async fn persist(&self, worker: &PeerId, account: &WorkerAccount) -> Result<()> {
        let raw = serde_json::to_vec(account)?;
        self.kv
            .put(&namespaced_key(LEDGER_NAMESPACE, worker), raw)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys::random_secret;
    use crate::signer::{PaymentSigner, verify};
    use taskmesh_storage::MemoryStore;

    async fn ledger() -> (Arc<dyn KvStore>, Arc<PaymentLedger>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let ledger = PaymentLedger::open(kv.clone()).await.unwrap();
        (kv, Arc::new(ledger))
    }

    #[tokio::test]
    async fn test_next_nonce_after_seed() {
        let (_, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        let recipient = Recipient::new([5; 32]);
        ledger.seed_nonce(&worker, 5).await.unwrap();

        let credit = ledger.issue(&worker, recipient, 10).await.unwrap();
        assert_eq!(credit, PaymentCredit::new(6, recipient, 10));

        let signer = PaymentSigner::new(random_secret());
        let mut signed = signer.sign(&credit).unwrap();
        assert!(verify(&signer.public_key(), &signed));
        signed.credit.amount = 11;
        assert!(!verify(&signer.public_key(), &signed));
    }

    #[tokio::test]
    async fn test_seed_never_lowers() {
        let (_, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        ledger.seed_nonce(&worker, 9).await.unwrap();
        ledger.seed_nonce(&worker, 3).await.unwrap();
        assert_eq!(ledger.last_nonce(&worker).await, Some(9));
    }

    #[tokio::test]
    async fn test_flush_returns_and_clears() {
        let (_, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        for _ in 0..3 {
            ledger.issue(&worker, Recipient::new([1; 32]), 1).await.unwrap();
        }
        assert_eq!(ledger.pending_total(), 3);
        let flushed = ledger.flush(&worker).await.unwrap();
        assert_eq!(flushed.iter().map(|c| c.nonce).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(ledger.flush(&worker).await.unwrap().is_empty());
        assert_eq!(ledger.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_issue_and_flush_yield_contiguous_nonces() {
        let (_, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        let mut handles = Vec::new();
        for i in 0..100u64 {
            let ledger = ledger.clone();
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                let credit = ledger.issue(&worker, Recipient::new([2; 32]), i).await.unwrap();
                let flushed = if i % 10 == 0 {
                    ledger.flush(&worker).await.unwrap()
                } else {
                    Vec::new()
                };
                (credit.nonce, flushed)
            }));
        }

        let mut issued = Vec::new();
        let mut flushed = Vec::new();
        for h in handles {
            let (nonce, batch) = h.await.unwrap();
            issued.push(nonce);
            flushed.extend(batch.into_iter().map(|c| c.nonce));
        }
        flushed.extend(ledger.flush(&worker).await.unwrap().into_iter().map(|c| c.nonce));

        issued.sort_unstable();
        flushed.sort_unstable();
        let expected: Vec<u64> = (1..=100).collect();
        assert_eq!(issued, expected);
        assert_eq!(flushed, expected);
    }

    #[tokio::test]
    async fn test_requeue_keeps_nonces() {
        let (_, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        ledger.issue(&worker, Recipient::new([1; 32]), 4).await.unwrap();
        ledger.issue(&worker, Recipient::new([1; 32]), 5).await.unwrap();
        let credits = ledger.flush(&worker).await.unwrap();
        let third = ledger.issue(&worker, Recipient::new([1; 32]), 6).await.unwrap();
        assert_eq!(third.nonce, 3);

        ledger.requeue(&worker, credits.clone()).await.unwrap();
        let again = ledger.flush(&worker).await.unwrap();
        assert_eq!(again.iter().map(|c| c.nonce).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(&again[..2], &credits[..]);
    }

    #[tokio::test]
    async fn test_reopen_restores_accounts() {
        let (kv, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        ledger.issue(&worker, Recipient::new([1; 32]), 4).await.unwrap();
        ledger.issue(&worker, Recipient::new([1; 32]), 5).await.unwrap();

        let reopened = PaymentLedger::open(kv).await.unwrap();
        assert_eq!(reopened.last_nonce(&worker).await, Some(2));
        assert_eq!(reopened.pending_total(), 2);
        let next = reopened.issue(&worker, Recipient::new([1; 32]), 1).await.unwrap();
        assert_eq!(next.nonce, 3);
    }

    #[tokio::test]
    async fn test_flush_all_groups_by_worker() {
        let (_, ledger) = ledger().await;
        let (a, b) = (PeerId::new("a"), PeerId::new("b"));
        ledger.issue(&a, Recipient::new([1; 32]), 1).await.unwrap();
        ledger.issue(&b, Recipient::new([2; 32]), 1).await.unwrap();
        ledger.issue(&b, Recipient::new([2; 32]), 1).await.unwrap();
        let all = ledger.flush_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, a);
        assert_eq!(all[1].1.len(), 2);
    }

    #[tokio::test]
    async fn test_unconfirmed_flush_survives_reopen() {
        let (kv, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        ledger.issue(&worker, Recipient::new([1; 32]), 4).await.unwrap();
        ledger.issue(&worker, Recipient::new([1; 32]), 5).await.unwrap();
        let flushed = ledger.flush(&worker).await.unwrap();
        assert_eq!(ledger.pending_total(), 0);
        assert_eq!(ledger.inflight_for(&worker).await, 2);

        // Crash before the batch reaches settlement.
        let reopened = PaymentLedger::open(kv).await.unwrap();
        assert_eq!(reopened.pending_total(), 2);
        assert_eq!(reopened.inflight_for(&worker).await, 0);
        assert_eq!(reopened.last_nonce(&worker).await, Some(2));
        assert_eq!(reopened.flush(&worker).await.unwrap(), flushed);
    }

    #[tokio::test]
    async fn test_confirmed_credits_are_not_restored() {
        let (kv, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        for amount in 1..=3 {
            ledger.issue(&worker, Recipient::new([1; 32]), amount).await.unwrap();
        }
        let flushed = ledger.flush(&worker).await.unwrap();
        ledger.confirm(&worker, &flushed[..2]).await.unwrap();
        assert_eq!(ledger.inflight_for(&worker).await, 1);

        let reopened = PaymentLedger::open(kv).await.unwrap();
        let again = reopened.flush(&worker).await.unwrap();
        assert_eq!(again.iter().map(|c| c.nonce).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_issue_for_credits_each_task_once() {
        let (kv, ledger) = ledger().await;
        let worker = PeerId::new("w1");
        let task = TaskId::new_v4();
        let first = ledger
            .issue_for(task, &worker, Recipient::new([1; 32]), 7)
            .await
            .unwrap();
        assert_eq!(first.map(|c| c.nonce), Some(1));
        assert!(ledger
            .issue_for(task, &worker, Recipient::new([1; 32]), 7)
            .await
            .unwrap()
            .is_none());
        assert!(ledger.is_credited(&worker, task).await);

        let reopened = PaymentLedger::open(kv).await.unwrap();
        assert!(reopened
            .issue_for(task, &worker, Recipient::new([1; 32]), 7)
            .await
            .unwrap()
            .is_none());
        assert_eq!(reopened.pending_total(), 1);
    }
}
