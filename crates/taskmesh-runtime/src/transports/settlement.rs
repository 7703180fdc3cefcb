use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::{EntityContext, Transport};
use crate::transports::worker_pool::Outbound;
use taskmesh_dispatch::{DispatchEvent, WorkerRegistry};
use taskmesh_payments::{
    BatchProofAggregator, PaymentConfig, PaymentLedger, PaymentPublicKey, PaymentSigner,
    SealedBatch,
};
use taskmesh_storage::{KvStore, namespaced_key};
use taskmesh_tasks::TaskStore;
use taskmesh_types::{
    ManagerMessage, MeshError, PaymentCredit, PeerId, Recipient, Result, SignedPayment, TaskState,
};

/// Receives sealed batches for on-chain settlement.
#[async_trait]
pub trait SettlementSink: Send + Sync {
    async fn submit(&self, batch: &SealedBatch) -> Result<()>;
}

/// Persists each sealed batch under `batch/<id>` for an external submitter.
pub struct StoreSink {
    kv: Arc<dyn KvStore>,
}

impl StoreSink {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl SettlementSink for StoreSink {
    async fn submit(&self, batch: &SealedBatch) -> Result<()> {
        let raw = serde_json::to_vec(&(&batch.proof, &batch.inputs))?;
        self.kv
            .put(&namespaced_key("batch", batch.proof.id), raw)
            .await
    }
}

/// Forwards sealed batches over a channel.
pub struct ChannelSink(pub mpsc::Sender<SealedBatch>);

#[async_trait]
impl SettlementSink for ChannelSink {
    async fn submit(&self, batch: &SealedBatch) -> Result<()> {
        self.0
            .send(batch.clone())
            .await
            .map_err(|_| MeshError::Internal("settlement channel closed".into()))
    }
}

/// Turns validated tasks into credits, signed payments and batch proofs.
pub struct Settlement {
    ledger: PaymentLedger,
    signer: PaymentSigner,
    aggregator: BatchProofAggregator,
    registry: Arc<WorkerRegistry>,
    sink: Arc<dyn SettlementSink>,
    outbox: mpsc::Sender<Outbound>,
    /// Worker owning each signed payment still waiting in the aggregator.
    owners: Mutex<HashMap<(Recipient, u64), PeerId>>,
}

impl Settlement {
    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    pub fn public_key(&self) -> PaymentPublicKey {
        self.signer.public_key()
    }

    async fn on_event(&self, event: DispatchEvent) -> Result<()> {
        let DispatchEvent::TaskValidated {
            task_id,
            worker,
            recipient,
            reward,
        } = event
        else {
            return Ok(());
        };
        if self
            .ledger
            .issue_for(task_id, &worker, recipient, reward)
            .await?
            .is_none()
        {
            return Ok(());
        }

        let waiting = self.ledger.pending_total() + self.aggregator.buffered().await;
        if waiting >= self.aggregator.batch_size() {
            self.settle(false).await?;
        }
        Ok(())
    }

    /// Credit every validated task the ledger has not seen yet, e.g. when
    /// the manager stopped between validation and issuance. Returns how many
    /// credits were issued.
    pub async fn reconcile(&self, tasks: &TaskStore) -> Result<usize> {
        let mut issued = 0;
        for record in tasks.list_by_state(TaskState::Validated).await {
            let task_id = record.id();
            let Some(worker) = record.state.assignee.clone() else {
                tracing::warn!(%task_id, "validated task has no assignee");
                continue;
            };
            if self.ledger.is_credited(&worker, task_id).await {
                continue;
            }
            let Some(state) = self.registry.get(&worker).await else {
                tracing::warn!(%task_id, worker = %worker, "validated task owner unknown, credit deferred");
                continue;
            };
            if self
                .ledger
                .issue_for(task_id, &worker, state.recipient, record.state.spec.reward)
                .await?
                .is_some()
            {
                issued += 1;
            }
        }
        if issued > 0 {
            tracing::info!(issued, "credited validated tasks missing from the ledger");
        }
        Ok(issued)
    }

    /// Sign every pending credit and seal full batches. With `force`, the
    /// remaining partial batch is sealed too. Returns how many batches were
    /// emitted.
    pub async fn settle(&self, force: bool) -> Result<usize> {
        let mut emitted = 0;
        let mut halted = false;

        for (worker, credits) in self.ledger.flush_all().await? {
            for (i, credit) in credits.iter().enumerate() {
                if halted {
                    self.ledger.requeue(&worker, credits[i..].to_vec()).await?;
                    break;
                }
                let payment = match self.signer.sign(credit) {
                    Ok(payment) => payment,
                    Err(e) => {
                        tracing::error!(worker = %worker, nonce = credit.nonce, error = %e, "payment signing failed");
                        self.ledger.requeue(&worker, credits[i..].to_vec()).await?;
                        break;
                    }
                };
                self.owners
                    .lock()
                    .await
                    .insert(owner_key(credit), worker.clone());
                if let Some(batch) = self.aggregator.push(payment).await {
                    if self.emit(batch).await? {
                        emitted += 1;
                    } else {
                        halted = true;
                    }
                }
            }
        }

        if halted {
            // Later payments must not overtake a failed batch.
            if let Some(rest) = self.aggregator.drain().await {
                self.return_to_ledger(&rest).await?;
            }
        } else if force {
            if let Some(batch) = self.aggregator.drain().await {
                if self.emit(batch).await? {
                    emitted += 1;
                }
            }
        }
        Ok(emitted)
    }

    /// Prove, hand off and deliver one batch. `Ok(false)` means the batch
    /// was rejected and its credits went back to the ledger.
    async fn emit(&self, batch: Vec<SignedPayment>) -> Result<bool> {
        let sealed = match self.aggregator.seal(&batch).await {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::error!(payments = batch.len(), error = %e, "batch proof generation failed");
                self.return_to_ledger(&batch).await?;
                return Ok(false);
            }
        };
        if let Err(e) = self.sink.submit(&sealed).await {
            tracing::error!(batch_id = %sealed.proof.id, error = %e, "settlement hand-off failed");
            self.return_to_ledger(&batch).await?;
            return Ok(false);
        }

        let batch_id = sealed.proof.id;
        tracing::info!(%batch_id, payments = sealed.payments.len(), "batch emitted");
        let mut delivered = Vec::with_capacity(sealed.payments.len());
        let mut by_worker: BTreeMap<PeerId, Vec<PaymentCredit>> = BTreeMap::new();
        {
            let mut owners = self.owners.lock().await;
            for payment in sealed.payments {
                let Some(worker) = owners.remove(&owner_key(&payment.credit)) else {
                    tracing::warn!(nonce = payment.credit.nonce, "no owner recorded for payment");
                    continue;
                };
                by_worker.entry(worker.clone()).or_default().push(payment.credit);
                delivered.push((worker, payment));
            }
        }
        // The sink owns the batch now; a restart must not sign it again.
        for (worker, credits) in &by_worker {
            if let Err(e) = self.ledger.confirm(worker, credits).await {
                tracing::error!(%batch_id, worker = %worker, error = %e, "hand-off not confirmed in ledger");
            }
        }

        let now = Utc::now();
        for (worker, payment) in delivered {
            if let Err(e) = self
                .registry
                .record_payout(&worker, payment.credit.nonce, now)
                .await
            {
                tracing::warn!(worker = %worker, error = %e, "payout not recorded");
            }
            let message = ManagerMessage::Payment { payment, batch_id };
            if self.outbox.send((worker, message)).await.is_err() {
                tracing::warn!(%batch_id, "outbox closed, payment not delivered");
            }
        }
        Ok(true)
    }

    async fn return_to_ledger(&self, payments: &[SignedPayment]) -> Result<()> {
        let mut by_worker: BTreeMap<PeerId, Vec<PaymentCredit>> = BTreeMap::new();
        {
            let mut owners = self.owners.lock().await;
            for payment in payments {
                if let Some(worker) = owners.remove(&owner_key(&payment.credit)) {
                    by_worker.entry(worker).or_default().push(payment.credit);
                }
            }
        }
        for (worker, credits) in by_worker {
            self.ledger.requeue(&worker, credits).await?;
        }
        Ok(())
    }

    /// Move anything still buffered back into the ledger so it persists.
    async fn park(&self) -> Result<()> {
        if let Some(rest) = self.aggregator.drain().await {
            self.return_to_ledger(&rest).await?;
        }
        Ok(())
    }
}

fn owner_key(credit: &PaymentCredit) -> (Recipient, u64) {
    (credit.recipient, credit.nonce)
}

async fn settlement_loop(
    settlement: Arc<Settlement>,
    mut events: mpsc::Receiver<DispatchEvent>,
    flush_interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                if let Err(e) = settlement.on_event(event).await {
                    tracing::error!(error = %e, "settlement event failed");
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = settlement.settle(true).await {
                    tracing::error!(error = %e, "periodic settlement failed");
                }
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Settlement loop shutting down");
                    break;
                }
            }
        }
    }

    if let Err(e) = settlement.park().await {
        tracing::error!(error = %e, "failed to return buffered payments to the ledger");
    }
}

/// Manager-side capability: payment issuance and batch settlement.
pub struct SettlementTransport {
    registry: Arc<WorkerRegistry>,
    config: PaymentConfig,
    sink: Arc<dyn SettlementSink>,
    outbox: mpsc::Sender<Outbound>,
    events: Mutex<Option<mpsc::Receiver<DispatchEvent>>>,
    settlement: OnceLock<Arc<Settlement>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SettlementTransport {
    pub const NAME: &'static str = "settlement";

    pub fn new(
        registry: Arc<WorkerRegistry>,
        config: PaymentConfig,
        sink: Arc<dyn SettlementSink>,
        events: mpsc::Receiver<DispatchEvent>,
        outbox: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            registry,
            config,
            sink,
            outbox,
            events: Mutex::new(Some(events)),
            settlement: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn settlement(&self) -> Result<&Arc<Settlement>> {
        self.settlement
            .get()
            .ok_or_else(|| MeshError::Internal("settlement is not initialized".into()))
    }

    pub async fn reconcile(&self, tasks: &TaskStore) -> Result<usize> {
        self.settlement()?.reconcile(tasks).await
    }
}

#[async_trait]
impl Transport for SettlementTransport {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn initialize(&self, ctx: &EntityContext) -> Result<()> {
        self.config.validate()?;
        let signer = PaymentSigner::from_key_bytes(ctx.identity().payment_key())?;
        let ledger = PaymentLedger::open(ctx.store()).await?;
        for worker in self.registry.all().await {
            ledger.seed_nonce(&worker.peer_id, worker.nonce).await?;
        }
        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| MeshError::Internal("settlement initialized twice".into()))?;

        let settlement = Arc::new(Settlement {
            aggregator: BatchProofAggregator::new(signer.public_key(), &self.config),
            ledger,
            signer,
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            outbox: self.outbox.clone(),
            owners: Mutex::new(HashMap::new()),
        });
        self.settlement
            .set(settlement.clone())
            .map_err(|_| MeshError::Internal("settlement initialized twice".into()))?;

        tracing::info!(
            batch_size = self.config.batch_size,
            pending = settlement.ledger.pending_total(),
            "settlement ready"
        );
        self.tasks.lock().await.push(tokio::spawn(settlement_loop(
            settlement,
            events,
            self.config.flush_interval(),
            ctx.shutdown_signal(),
        )));
        Ok(())
    }

    async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "settlement task ended abnormally");
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
