use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::transport::{EntityContext, Transport};
use taskmesh_payments::{PaymentPublicKey, verify};
use taskmesh_storage::{KvStore, namespaced_key};
use taskmesh_types::{
    ManagerMessage, MeshError, Recipient, Result, SignedPayment, TaskAssignment, WorkerMessage,
};

const WALLET_NAMESPACE: &str = "wallet";
const LAST_NONCE_KEY: &[u8] = b"wallet-meta/last_nonce";

/// Worker-side task execution hook.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Whether to take the task. Declined tasks are left to expire.
    async fn accept(&self, _assignment: &TaskAssignment) -> bool {
        true
    }

    async fn execute(&self, assignment: &TaskAssignment) -> Result<serde_json::Value>;
}

/// Returns the task's template data as its result.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, assignment: &TaskAssignment) -> Result<serde_json::Value> {
        Ok(assignment.template_data.clone())
    }
}

/// Worker-side capability: runs assigned tasks and collects payments.
///
/// Payments are verified against the manager's payment key and must carry
/// strictly increasing nonces; anything else is rejected as a replay.
pub struct TaskRunnerTransport {
    executor: Arc<dyn TaskExecutor>,
    manager_key: PaymentPublicKey,
    recipient: Recipient,
    outbox: mpsc::Sender<WorkerMessage>,
    store: OnceLock<Arc<dyn KvStore>>,
    last_nonce: Mutex<u64>,
    banned: Arc<AtomicBool>,
    /// Running task executions, aborted on shutdown.
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunnerTransport {
    pub const NAME: &'static str = "task-runner";

    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        manager_key: PaymentPublicKey,
        recipient: Recipient,
        outbox: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            executor,
            manager_key,
            recipient,
            outbox,
            store: OnceLock::new(),
            last_nonce: Mutex::new(0),
            banned: Arc::new(AtomicBool::new(false)),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn recipient(&self) -> Recipient {
        self.recipient
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::SeqCst)
    }

    pub async fn last_nonce(&self) -> u64 {
        *self.last_nonce.lock().await
    }

    /// Apply one inbound manager message.
    pub async fn handle_message(&self, message: ManagerMessage) -> Result<()> {
        match message {
            ManagerMessage::AssignTask { assignment } => {
                self.run_task(assignment).await;
                Ok(())
            }
            ManagerMessage::Payment { payment, batch_id } => {
                self.receive_payment(payment).await?;
                tracing::info!(%batch_id, nonce = payment.credit.nonce, amount = payment.credit.amount, "payment received");
                Ok(())
            }
            ManagerMessage::Banned => {
                self.banned.store(true, Ordering::SeqCst);
                tracing::warn!("banned by manager");
                Ok(())
            }
        }
    }

    /// Every payment accepted so far, in nonce order.
    pub async fn payments(&self) -> Result<Vec<SignedPayment>> {
        let store = self.store()?;
        let prefix = format!("{WALLET_NAMESPACE}/");
        let mut out = Vec::new();
        for key in store.keys_with_prefix(prefix.as_bytes()).await? {
            if let Some(raw) = store.get(&key).await? {
                out.push(serde_json::from_slice::<SignedPayment>(&raw)?);
            }
        }
        out.sort_by_key(|p| p.credit.nonce);
        Ok(out)
    }

    async fn run_task(&self, assignment: TaskAssignment) {
        let task_id = assignment.task_id;
        if self.is_banned() {
            tracing::debug!(%task_id, "banned, assignment ignored");
            return;
        }
        let executor = self.executor.clone();
        let outbox = self.outbox.clone();
        let banned = self.banned.clone();
        let job = tokio::spawn(async move {
            if !executor.accept(&assignment).await {
                tracing::info!(%task_id, "task declined");
                return;
            }
            if banned.load(Ordering::SeqCst) {
                tracing::debug!(%task_id, "banned before accepting");
                return;
            }
            if outbox.send(WorkerMessage::Accept { task_id }).await.is_err() {
                tracing::warn!(%task_id, "outbox closed, task not accepted");
                return;
            }
            match executor.execute(&assignment).await {
                Ok(result) => {
                    if outbox
                        .send(WorkerMessage::Submit { task_id, result })
                        .await
                        .is_err()
                    {
                        tracing::warn!(%task_id, "outbox closed, result not submitted");
                    } else {
                        tracing::info!(%task_id, "task submitted");
                    }
                }
                Err(e) => tracing::warn!(%task_id, error = %e, "task execution failed"),
            }
        });

        let mut jobs = self.jobs.lock().await;
        jobs.retain(|job| !job.is_finished());
        jobs.push(job);
    }

    /// Executions that have not finished yet.
    pub async fn running(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        jobs.retain(|job| !job.is_finished());
        jobs.len()
    }

    async fn receive_payment(&self, payment: SignedPayment) -> Result<()> {
        let credit = payment.credit;
        if credit.recipient != self.recipient {
            return Err(MeshError::PaymentRejected(format!(
                "payment {} addressed to {}",
                credit.nonce, credit.recipient
            )));
        }
        if !verify(&self.manager_key, &payment) {
            tracing::error!(nonce = credit.nonce, "payment signature does not verify");
            return Err(MeshError::PaymentRejected(format!(
                "invalid signature on payment {}",
                credit.nonce
            )));
        }

        let store = self.store()?;
        let mut last = self.last_nonce.lock().await;
        if credit.nonce <= *last {
            tracing::warn!(nonce = credit.nonce, last = *last, "replayed payment rejected");
            return Err(MeshError::PaymentRejected(format!(
                "nonce {} not above last accepted {}",
                credit.nonce, *last
            )));
        }
        store
            .put(
                &namespaced_key(WALLET_NAMESPACE, format!("{:020}", credit.nonce)),
                serde_json::to_vec(&payment)?,
            )
            .await?;
        store
            .put(LAST_NONCE_KEY, credit.nonce.to_le_bytes().to_vec())
            .await?;
        *last = credit.nonce;
        Ok(())
    }

    fn store(&self) -> Result<&Arc<dyn KvStore>> {
        self.store
            .get()
            .ok_or_else(|| MeshError::Internal("task runner is not initialized".into()))
    }
}

#[async_trait]
impl Transport for TaskRunnerTransport {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn initialize(&self, ctx: &EntityContext) -> Result<()> {
        let store = ctx.store();
        if let Some(raw) = store.get(LAST_NONCE_KEY).await? {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| MeshError::Storage("corrupt wallet nonce".into()))?;
            *self.last_nonce.lock().await = u64::from_le_bytes(bytes);
        }
        self.store
            .set(store)
            .map_err(|_| MeshError::Internal("task runner initialized twice".into()))?;

        self.outbox
            .send(WorkerMessage::Register {
                recipient: self.recipient,
            })
            .await
            .map_err(|_| MeshError::Internal("worker outbox closed".into()))?;
        tracing::info!(peer_id = %ctx.peer_id(), recipient = %self.recipient, "task runner registered");
        Ok(())
    }

    async fn shutdown(&self) {
        let jobs: Vec<JoinHandle<()>> = self.jobs.lock().await.drain(..).collect();
        for job in jobs {
            // Unfinished tasks are left to expire on the manager.
            job.abort();
            if let Err(e) = job.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "task execution ended abnormally");
                }
            }
        }
        if self.outbox.send(WorkerMessage::Disconnect).await.is_err() {
            tracing::warn!("outbox closed, disconnect not sent");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
