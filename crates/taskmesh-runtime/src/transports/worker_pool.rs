use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::transport::{EntityContext, Transport};
use taskmesh_dispatch::{
    DispatchConfig, DispatchEvent, ExpirySweeper, TaskDispatcher, ValidationOutcome,
    ValidationPolicy, WorkerRegistry,
};
use taskmesh_tasks::TaskStore;
use taskmesh_types::{
    ManagerMessage, MeshError, PeerId, Result, TaskId, TaskSpec, TaskState, WorkerMessage,
};

/// Messages the manager wants delivered to a peer.
pub type Outbound = (PeerId, ManagerMessage);

/// Manager-side capability: worker bookkeeping, dispatch and expiry.
pub struct WorkerPoolTransport {
    registry: Arc<WorkerRegistry>,
    validator: Arc<dyn ValidationPolicy>,
    config: DispatchConfig,
    events: mpsc::Sender<DispatchEvent>,
    outbox: mpsc::Sender<Outbound>,
    dispatcher: OnceLock<Arc<TaskDispatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolTransport {
    pub const NAME: &'static str = "worker-pool";

    pub fn new(
        registry: Arc<WorkerRegistry>,
        validator: Arc<dyn ValidationPolicy>,
        config: DispatchConfig,
        events: mpsc::Sender<DispatchEvent>,
        outbox: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            registry,
            validator,
            config,
            events,
            outbox,
            dispatcher: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn dispatcher(&self) -> Result<&Arc<TaskDispatcher>> {
        self.dispatcher
            .get()
            .ok_or_else(|| MeshError::Internal("worker pool is not initialized".into()))
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.dispatcher()?.submit_task(spec).await
    }

    pub async fn task_state(&self, task_id: TaskId) -> Result<TaskState> {
        Ok(self.dispatcher()?.store().get(task_id).await?.state.state)
    }

    pub async fn on_validation_outcome(
        &self,
        task_id: TaskId,
        outcome: ValidationOutcome,
    ) -> Result<TaskState> {
        self.dispatcher()?
            .on_validation_outcome(task_id, outcome)
            .await
    }

    pub async fn ban(&self, peer: &PeerId) -> Result<()> {
        self.dispatcher()?.ban_worker(peer).await?;
        let _ = self.outbox.send((peer.clone(), ManagerMessage::Banned)).await;
        Ok(())
    }

    pub async fn unban(&self, peer: &PeerId) -> Result<()> {
        self.dispatcher()?.unban_worker(peer).await
    }

    /// Apply one inbound worker message.
    pub async fn handle_message(&self, peer: &PeerId, message: WorkerMessage) -> Result<()> {
        let dispatcher = self.dispatcher()?;
        match message {
            WorkerMessage::Register { recipient } => {
                match dispatcher.register_worker(peer, recipient).await {
                    Ok(_) => Ok(()),
                    Err(MeshError::WorkerBanned(_)) => {
                        let _ = self.outbox.send((peer.clone(), ManagerMessage::Banned)).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            WorkerMessage::Accept { task_id } => dispatcher.on_accept(task_id, peer).await,
            WorkerMessage::Submit { task_id, result } => dispatcher
                .on_submission(task_id, peer, result)
                .await
                .map(|_| ()),
            WorkerMessage::Disconnect => {
                dispatcher.remove_peer(peer).await;
                Ok(())
            }
        }
    }
}

async fn dispatch_loop(
    dispatcher: Arc<TaskDispatcher>,
    outbox: mpsc::Sender<Outbound>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        match dispatcher.dispatch().await {
            Ok(assignments) => {
                for a in assignments {
                    let message = ManagerMessage::AssignTask {
                        assignment: a.assignment,
                    };
                    if outbox.send((a.worker, message)).await.is_err() {
                        tracing::warn!("outbox closed, stopping dispatch loop");
                        return;
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "dispatch round failed"),
        }

        tokio::select! {
            _ = dispatcher.wait_for_work() => {}
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Dispatch loop shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for WorkerPoolTransport {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn initialize(&self, ctx: &EntityContext) -> Result<()> {
        self.config.validate()?;
        self.registry.restore().await?;
        let store = Arc::new(TaskStore::open(ctx.store()).await?);
        let dispatcher = Arc::new(
            TaskDispatcher::new(
                store,
                self.registry.clone(),
                self.validator.clone(),
                self.config.clone(),
            )
            .with_events(self.events.clone()),
        );
        dispatcher.recover().await?;
        self.dispatcher
            .set(dispatcher.clone())
            .map_err(|_| MeshError::Internal("worker pool initialized twice".into()))?;

        let sweeper = ExpirySweeper::new(dispatcher.clone(), ctx.shutdown_signal());
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(sweeper.run()));
        tasks.push(tokio::spawn(dispatch_loop(
            dispatcher,
            self.outbox.clone(),
            ctx.shutdown_signal(),
        )));
        tracing::info!(validator = self.validator.name(), "worker pool ready");
        Ok(())
    }

    async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "worker pool task ended abnormally");
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
