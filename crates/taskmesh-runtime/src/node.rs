//! Pre-wired manager and worker entities.
//!
//! Neither node owns a network socket: inbound messages are fed through
//! `handle`, and outbound messages come out of the receiver returned by
//! `start`, so any transport can carry them.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::NodeConfig;
use crate::entity::{Entity, EntityBuilder};
use crate::identity::Identity;
use crate::transports::worker_pool::Outbound;
use crate::transports::{
    SettlementSink, SettlementTransport, TaskExecutor, TaskRunnerTransport, WorkerPoolTransport,
};
use taskmesh_dispatch::{ValidationPolicy, WorkerRegistry};
use taskmesh_payments::PaymentPublicKey;
use taskmesh_storage::KvStore;
use taskmesh_types::{
    ManagerMessage, MeshError, PeerId, Recipient, Result, TaskId, TaskSpec, WorkerMessage,
};

pub struct ManagerNode {
    entity: Entity,
}

impl ManagerNode {
    pub async fn start(
        config: &NodeConfig,
        store: Arc<dyn KvStore>,
        identity: Identity,
        validator: Arc<dyn ValidationPolicy>,
        sink: Arc<dyn SettlementSink>,
    ) -> Result<(Self, mpsc::Receiver<Outbound>)> {
        config
            .validate()
            .map_err(|e| MeshError::Config(e.to_string()))?;

        let registry = Arc::new(WorkerRegistry::new(store.clone()));
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (outbox_tx, outbox_rx) = mpsc::channel(config.channel_capacity);

        let pool = WorkerPoolTransport::new(
            registry.clone(),
            validator,
            config.dispatch.clone(),
            events_tx,
            outbox_tx.clone(),
        );
        let settlement = SettlementTransport::new(
            registry,
            config.payments.clone(),
            sink,
            events_rx,
            outbox_tx,
        );

        // The pool restores the registry that settlement seeds nonces from.
        let entity = EntityBuilder::new(store, identity)
            .with(Arc::new(pool))
            .with(Arc::new(settlement))
            .build()
            .await?;
        let node = Self { entity };
        let tasks = node.worker_pool()?.dispatcher()?.store().clone();
        node.settlement()?.reconcile(&tasks).await?;
        Ok((node, outbox_rx))
    }

    pub fn peer_id(&self) -> &PeerId {
        self.entity.peer_id()
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn worker_pool(&self) -> Result<&WorkerPoolTransport> {
        self.entity
            .transport::<WorkerPoolTransport>()
            .ok_or_else(|| MeshError::Internal("worker pool transport missing".into()))
    }

    pub fn settlement(&self) -> Result<&SettlementTransport> {
        self.entity
            .transport::<SettlementTransport>()
            .ok_or_else(|| MeshError::Internal("settlement transport missing".into()))
    }

    pub async fn handle(&self, peer: &PeerId, message: WorkerMessage) -> Result<()> {
        self.worker_pool()?.handle_message(peer, message).await
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.worker_pool()?.submit_task(spec).await
    }

    pub async fn shutdown(&self) {
        self.entity.shutdown().await;
    }
}

pub struct WorkerNode {
    entity: Entity,
}

impl WorkerNode {
    pub async fn start(
        store: Arc<dyn KvStore>,
        identity: Identity,
        executor: Arc<dyn TaskExecutor>,
        manager_key: PaymentPublicKey,
        recipient: Recipient,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<WorkerMessage>)> {
        if capacity == 0 {
            return Err(MeshError::Config("channel capacity must be > 0".into()));
        }
        let (tx, rx) = mpsc::channel(capacity);
        let runner = TaskRunnerTransport::new(executor, manager_key, recipient, tx);
        let entity = EntityBuilder::new(store, identity)
            .with(Arc::new(runner))
            .build()
            .await?;
        Ok((Self { entity }, rx))
    }

    pub fn peer_id(&self) -> &PeerId {
        self.entity.peer_id()
    }

    pub fn runner(&self) -> Result<&TaskRunnerTransport> {
        self.entity
            .transport::<TaskRunnerTransport>()
            .ok_or_else(|| MeshError::Internal("task runner transport missing".into()))
    }

    pub async fn handle(&self, message: ManagerMessage) -> Result<()> {
        self.runner()?.handle_message(message).await
    }

    pub async fn shutdown(&self) {
        self.entity.shutdown().await;
    }
}
