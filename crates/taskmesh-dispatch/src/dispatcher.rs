use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::config::{DispatchConfig, MAX_TIME_LIMIT_SECS};
use crate::policy::{ValidationOutcome, ValidationPolicy};
use crate::queue::PeerQueue;
use crate::registry::WorkerRegistry;
use taskmesh_tasks::{TaskRecord, TaskStore};
use taskmesh_types::{
    MeshError, PeerId, Recipient, Result, TaskAssignment, TaskEvent, TaskEventKind, TaskId,
    TaskSpec, TaskState, WorkerState,
};

/// Lifecycle notifications for other components of the entity.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    TaskValidated {
        task_id: TaskId,
        worker: PeerId,
        recipient: Recipient,
        reward: u64,
    },
    TaskRejected {
        task_id: TaskId,
        worker: PeerId,
        reason: String,
    },
    TaskExpired {
        task_id: TaskId,
        worker: Option<PeerId>,
        retry: Option<TaskId>,
    },
}

/// A task bound to a worker by `dispatch`, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub worker: PeerId,
    pub assignment: TaskAssignment,
}

/// Assigns backlog tasks to queued workers and drives the task lifecycle.
///
/// All task state lives in the [`TaskStore`] event log; the backlog and the
/// peer queue are scheduling hints rebuilt by [`TaskDispatcher::recover`].
pub struct TaskDispatcher {
    store: Arc<TaskStore>,
    workers: Arc<WorkerRegistry>,
    queue: Mutex<PeerQueue>,
    /// Peers registered and not yet disconnected, banned or not.
    connected: Mutex<HashSet<PeerId>>,
    backlog: Mutex<VecDeque<TaskId>>,
    validator: Arc<dyn ValidationPolicy>,
    events: Option<mpsc::Sender<DispatchEvent>>,
    config: DispatchConfig,
    work_available: Notify,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        workers: Arc<WorkerRegistry>,
        validator: Arc<dyn ValidationPolicy>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            workers,
            queue: Mutex::new(PeerQueue::new()),
            connected: Mutex::new(HashSet::new()),
            backlog: Mutex::new(VecDeque::new()),
            validator,
            events: None,
            config,
            work_available: Notify::new(),
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Put every task still in `Created` back into the backlog after a restart.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.store.list_by_state(TaskState::Created).await;
        let mut backlog = self.backlog.lock().await;
        for record in &pending {
            if !backlog.contains(&record.id()) {
                backlog.push_back(record.id());
            }
        }
        drop(backlog);
        if !pending.is_empty() {
            tracing::info!(tasks = pending.len(), "re-queued pending tasks");
            self.work_available.notify_one();
        }
        Ok(pending.len())
    }

    /// Record a new task and queue it for dispatch.
    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        if let Some(limit) = spec.time_limit_secs {
            if limit == 0 || limit > MAX_TIME_LIMIT_SECS {
                return Err(MeshError::InvalidTask(format!(
                    "time limit {limit}s outside 1..={MAX_TIME_LIMIT_SECS}s"
                )));
            }
        }
        let record = self.store.create(spec, 0, None).await?;
        let task_id = record.id();
        self.backlog.lock().await.push_back(task_id);
        tracing::info!(%task_id, reward = record.state.spec.reward, "task submitted");
        self.work_available.notify_one();
        Ok(task_id)
    }

    /// First contact or reconnect from a worker.
    pub async fn register_worker(&self, peer: &PeerId, recipient: Recipient) -> Result<WorkerState> {
        let state = self.workers.register(peer, recipient).await?;
        self.connected.lock().await.insert(peer.clone());
        if state.banned {
            tracing::warn!(worker = %peer, "banned worker tried to register");
            return Err(MeshError::WorkerBanned(peer.clone()));
        }
        if self.queue.lock().await.add_peer(peer.clone()) {
            tracing::info!(worker = %peer, "worker queued");
            self.work_available.notify_one();
        }
        Ok(state)
    }

    /// Disconnect: the peer leaves the rotation; its open tasks expire normally.
    pub async fn remove_peer(&self, peer: &PeerId) -> bool {
        self.connected.lock().await.remove(peer);
        let removed = self.queue.lock().await.remove(peer);
        if removed {
            tracing::warn!(worker = %peer, "worker removed from queue");
        }
        removed
    }

    pub async fn ban_worker(&self, peer: &PeerId) -> Result<()> {
        self.workers.set_banned(peer, true).await?;
        self.queue.lock().await.remove(peer);
        tracing::warn!(worker = %peer, "worker banned");
        Ok(())
    }

    /// Lift a ban. A peer that disconnected meanwhile rejoins the rotation
    /// only when it registers again.
    pub async fn unban_worker(&self, peer: &PeerId) -> Result<()> {
        self.workers.set_banned(peer, false).await?;
        if self.connected.lock().await.contains(peer) {
            self.queue.lock().await.add_peer(peer.clone());
            self.work_available.notify_one();
        }
        tracing::info!(worker = %peer, "worker unbanned");
        Ok(())
    }

    /// Assign as many backlog tasks as there are queued workers.
    ///
    /// Returns immediately when the queue runs dry; unassigned tasks stay in
    /// the backlog until the next call. A storage failure puts the task back
    /// at the front and ends the round.
    pub async fn dispatch(&self) -> Result<Vec<Assignment>> {
        let mut assignments = Vec::new();
        loop {
            let Some(task_id) = self.backlog.lock().await.pop_front() else {
                break;
            };

            let record = match self.store.get(task_id).await {
                Ok(record) if record.state.state == TaskState::Created => record,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(%task_id, error = %e, "dropping unknown task from backlog");
                    continue;
                }
            };

            let Some(worker) = self.next_worker().await else {
                self.backlog.lock().await.push_front(task_id);
                tracing::debug!(%task_id, "no workers available, deferring");
                break;
            };

            let limit = record
                .state
                .spec
                .time_limit_secs
                .unwrap_or(self.config.default_time_limit_secs);
            let deadline = deadline_after(Utc::now(), limit);
            let event = TaskEvent::new(TaskEventKind::Assigned {
                worker: worker.clone(),
                deadline,
            });
            match self.store.append(task_id, event).await {
                Ok(record) => {
                    tracing::info!(%task_id, worker = %worker, %deadline, "task assigned");
                    assignments.push(Assignment {
                        worker,
                        assignment: TaskAssignment::from(&record.state),
                    });
                }
                Err(e @ (MeshError::TaskValidation { .. } | MeshError::TaskExpired { .. })) => {
                    tracing::warn!(%task_id, error = %e, "assignment rejected by task store");
                }
                Err(e) => {
                    tracing::error!(%task_id, error = %e, "assignment not recorded, task kept in backlog");
                    self.backlog.lock().await.push_front(task_id);
                    break;
                }
            }
            tokio::task::yield_now().await;
        }
        Ok(assignments)
    }

    /// Explicit acceptance from the assigned worker. Repeats are ignored.
    pub async fn on_accept(&self, task_id: TaskId, worker: &PeerId) -> Result<()> {
        let record = self.store.get(task_id).await?;
        self.ensure_assigned(&record, worker, TaskState::Assigned)?;
        if record.state.accepted {
            tracing::debug!(%task_id, worker = %worker, "duplicate acceptance ignored");
            return Ok(());
        }
        self.store
            .append(task_id, TaskEvent::new(TaskEventKind::Accepted))
            .await?;
        self.workers
            .update(worker, |w| w.record_accepted())
            .await?;
        tracing::info!(%task_id, worker = %worker, "task accepted");
        Ok(())
    }

    /// Record a submission and run it through the validation policy.
    pub async fn on_submission(
        &self,
        task_id: TaskId,
        worker: &PeerId,
        result: serde_json::Value,
    ) -> Result<TaskState> {
        let record = self.store.get(task_id).await?;
        self.ensure_assigned(&record, worker, TaskState::Assigned)?;

        let validation_deadline = deadline_after(Utc::now(), self.config.validation_window_secs);
        let record = self
            .store
            .append(
                task_id,
                TaskEvent::new(TaskEventKind::Submitted {
                    result: result.clone(),
                    validation_deadline,
                }),
            )
            .await?;
        tracing::info!(%task_id, worker = %worker, "submission received");

        let outcome = self.validator.validate(&record.state, &result).await?;
        self.apply_outcome(record, outcome).await
    }

    /// Feed back a validation outcome that the policy deferred.
    pub async fn on_validation_outcome(
        &self,
        task_id: TaskId,
        outcome: ValidationOutcome,
    ) -> Result<TaskState> {
        let record = self.store.get(task_id).await?;
        self.apply_outcome(record, outcome).await
    }

    /// Expire a task and, within the retry budget, queue a fresh attempt.
    /// Returns the id of the retry task, if one was created.
    pub async fn on_expire(&self, task_id: TaskId) -> Result<Option<TaskId>> {
        let record = self
            .store
            .append(task_id, TaskEvent::new(TaskEventKind::Expired))
            .await?;
        let task = &record.state;
        tracing::warn!(%task_id, worker = ?task.assignee, attempt = task.attempt, "task expired");

        let retry = if task.attempt < self.config.max_retries {
            let retry = self
                .store
                .create(task.spec.clone(), task.attempt + 1, Some(task_id))
                .await?;
            self.backlog.lock().await.push_back(retry.id());
            self.work_available.notify_one();
            tracing::info!(%task_id, retry = %retry.id(), attempt = task.attempt + 1, "task re-queued");
            Some(retry.id())
        } else {
            None
        };

        self.emit(DispatchEvent::TaskExpired {
            task_id,
            worker: task.assignee.clone(),
            retry,
        })
        .await;
        Ok(retry)
    }

    /// Expire every active task whose deadline is at or before `now`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut expired = Vec::new();
        for record in self.store.list_active().await {
            if !record.state.is_overdue(now) {
                continue;
            }
            match self.on_expire(record.id()).await {
                Ok(_) => expired.push(record.id()),
                // Lost a race with a submission or outcome; nothing to do.
                Err(e) => tracing::debug!(task_id = %record.id(), error = %e, "expiry skipped"),
            }
        }
        expired
    }

    /// Resolves when new work or a new worker may make `dispatch` productive.
    pub async fn wait_for_work(&self) {
        self.work_available.notified().await;
    }

    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    pub async fn queued_peers(&self) -> Vec<PeerId> {
        self.queue.lock().await.peers()
    }

    async fn next_worker(&self) -> Option<PeerId> {
        let attempts = self.queue.lock().await.len();
        for _ in 0..attempts {
            let peer = self.queue.lock().await.dequeue()?;
            if self.workers.is_banned(&peer).await {
                tracing::warn!(worker = %peer, "skipping banned worker");
                self.queue.lock().await.remove(&peer);
                continue;
            }
            return Some(peer);
        }
        None
    }

    fn ensure_assigned(&self, record: &TaskRecord, worker: &PeerId, expected: TaskState) -> Result<()> {
        let task = &record.state;
        if task.state.is_terminal() {
            return Err(MeshError::TaskExpired {
                task_id: task.id,
                state: task.state,
            });
        }
        if task.state != expected || task.assignee.as_ref() != Some(worker) {
            return Err(MeshError::NotAssigned {
                task_id: task.id,
                worker: worker.clone(),
            });
        }
        Ok(())
    }

    async fn apply_outcome(&self, record: TaskRecord, outcome: ValidationOutcome) -> Result<TaskState> {
        let task_id = record.id();
        let worker = record
            .state
            .assignee
            .clone()
            .ok_or_else(|| MeshError::Internal(format!("submitted task {task_id} has no assignee")))?;

        match outcome {
            ValidationOutcome::Pending => {
                tracing::debug!(%task_id, "validation deferred");
                Ok(record.state.state)
            }
            ValidationOutcome::Valid => {
                let record = self
                    .store
                    .append(task_id, TaskEvent::new(TaskEventKind::Validated))
                    .await?;
                tracing::info!(%task_id, worker = %worker, reward = record.state.spec.reward, "task validated");
                // The task is already Validated; counters must not stand in
                // the way of the payment event.
                let recipient = match self.workers.update(&worker, |w| w.record_completed()).await {
                    Ok(state) => Some(state.recipient),
                    Err(e) => {
                        tracing::warn!(%task_id, worker = %worker, error = %e, "completion not counted");
                        self.workers.get(&worker).await.map(|w| w.recipient)
                    }
                };
                match recipient {
                    Some(recipient) => {
                        self.emit(DispatchEvent::TaskValidated {
                            task_id,
                            worker,
                            recipient,
                            reward: record.state.spec.reward,
                        })
                        .await
                    }
                    None => {
                        tracing::error!(%task_id, worker = %worker, "no recipient on record, payment deferred")
                    }
                }
                Ok(record.state.state)
            }
            ValidationOutcome::Invalid { reason } => {
                let record = self
                    .store
                    .append(
                        task_id,
                        TaskEvent::new(TaskEventKind::Rejected {
                            reason: reason.clone(),
                        }),
                    )
                    .await?;
                self.workers
                    .update(&worker, |w| w.record_rejected())
                    .await?;
                tracing::info!(%task_id, worker = %worker, %reason, "task rejected");
                self.emit(DispatchEvent::TaskRejected {
                    task_id,
                    worker,
                    reason,
                })
                .await;
                Ok(record.state.state)
            }
        }
    }

    async fn emit(&self, event: DispatchEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.send(event).await {
                tracing::error!(event = ?e.0, "dispatch event dropped: receiver closed");
            }
        }
    }
}

/// `now + secs`, with `secs` capped at [`MAX_TIME_LIMIT_SECS`].
fn deadline_after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(secs.min(MAX_TIME_LIMIT_SECS)).unwrap_or(i64::MAX);
    TimeDelta::try_seconds(secs)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AcceptAll, ExternalReview};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};
    use taskmesh_storage::{KvStore, MemoryStore};

    /// Memory store whose log appends can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &[u8]) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn append(&self, key: &[u8], value: Vec<u8>) -> Result<u64> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(MeshError::Storage("disk full".into()));
            }
            self.inner.append(key, value).await
        }

        async fn read_log(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
            self.inner.read_log(key).await
        }

        async fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
            self.inner.keys_with_prefix(prefix).await
        }
    }

    async fn dispatcher_with(
        validator: Arc<dyn ValidationPolicy>,
        config: DispatchConfig,
    ) -> (TaskDispatcher, mpsc::Receiver<DispatchEvent>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let store = Arc::new(TaskStore::open(kv.clone()).await.unwrap());
        let workers = Arc::new(WorkerRegistry::new(kv));
        let (tx, rx) = mpsc::channel(64);
        (
            TaskDispatcher::new(store, workers, validator, config).with_events(tx),
            rx,
        )
    }

    async fn dispatcher() -> (TaskDispatcher, mpsc::Receiver<DispatchEvent>) {
        dispatcher_with(Arc::new(AcceptAll), DispatchConfig::default()).await
    }

    fn peer(s: &str) -> PeerId {
        PeerId::new(s)
    }

    #[tokio::test]
    async fn test_dispatch_round_robin_across_workers() {
        let (d, _rx) = dispatcher().await;
        for p in ["A", "B", "C"] {
            d.register_worker(&peer(p), Recipient::new([0; 32])).await.unwrap();
        }
        let mut order = Vec::new();
        for i in 0..4 {
            d.submit_task(TaskSpec::new(format!("t{i}"), 1)).await.unwrap();
            let assigned = d.dispatch().await.unwrap();
            assert_eq!(assigned.len(), 1);
            order.push(assigned[0].worker.clone());
        }
        assert_eq!(order, vec![peer("A"), peer("B"), peer("C"), peer("A")]);
    }

    #[tokio::test]
    async fn test_dispatch_without_workers_keeps_backlog() {
        let (d, _rx) = dispatcher().await;
        d.submit_task(TaskSpec::new("t", 1)).await.unwrap();
        d.submit_task(TaskSpec::new("t", 1)).await.unwrap();
        assert!(d.dispatch().await.unwrap().is_empty());
        assert_eq!(d.backlog_len().await, 2);

        d.register_worker(&peer("A"), Recipient::new([0; 32])).await.unwrap();
        let assigned = d.dispatch().await.unwrap();
        // One worker in the rotation still receives both tasks, one per turn.
        assert_eq!(assigned.len(), 2);
        assert_eq!(d.backlog_len().await, 0);
    }

    #[tokio::test]
    async fn test_assignment_alone_is_not_acceptance() {
        let (d, _rx) = dispatcher().await;
        let a = peer("A");
        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        let task_id = d.submit_task(TaskSpec::new("t", 1)).await.unwrap();
        d.dispatch().await.unwrap();
        assert_eq!(d.workers().get(&a).await.unwrap().counters.total_tasks, 0);

        d.on_accept(task_id, &a).await.unwrap();
        let state = d.workers().get(&a).await.unwrap();
        assert_eq!(state.counters.total_tasks, 1);
        assert_eq!(state.counters.tasks_accepted, 1);
    }

    #[tokio::test]
    async fn test_accept_by_wrong_worker() {
        let (d, _rx) = dispatcher().await;
        d.register_worker(&peer("A"), Recipient::new([0; 32])).await.unwrap();
        d.register_worker(&peer("B"), Recipient::new([0; 32])).await.unwrap();
        let task_id = d.submit_task(TaskSpec::new("t", 1)).await.unwrap();
        d.dispatch().await.unwrap();
        let err = d.on_accept(task_id, &peer("B")).await.unwrap_err();
        assert!(matches!(err, MeshError::NotAssigned { .. }));
    }

    #[tokio::test]
    async fn test_submission_validated_emits_event() {
        let (d, mut rx) = dispatcher().await;
        let a = peer("A");
        d.register_worker(&a, Recipient::new([7; 32])).await.unwrap();
        let task_id = d.submit_task(TaskSpec::new("t", 10)).await.unwrap();
        d.dispatch().await.unwrap();
        d.on_accept(task_id, &a).await.unwrap();

        let state = d
            .on_submission(task_id, &a, serde_json::json!({"out": 1}))
            .await
            .unwrap();
        assert_eq!(state, TaskState::Validated);
        assert_eq!(
            rx.recv().await.unwrap(),
            DispatchEvent::TaskValidated {
                task_id,
                worker: a.clone(),
                recipient: Recipient::new([7; 32]),
                reward: 10,
            }
        );
        assert_eq!(d.workers().get(&a).await.unwrap().counters.tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_deferred_validation_outcome() {
        let (d, mut rx) =
            dispatcher_with(Arc::new(ExternalReview), DispatchConfig::default()).await;
        let a = peer("A");
        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        let task_id = d.submit_task(TaskSpec::new("t", 3)).await.unwrap();
        d.dispatch().await.unwrap();
        let state = d
            .on_submission(task_id, &a, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(state, TaskState::Submitted);

        let state = d
            .on_validation_outcome(
                task_id,
                ValidationOutcome::Invalid {
                    reason: "wrong hash".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(state, TaskState::Rejected);
        assert!(matches!(
            rx.recv().await.unwrap(),
            DispatchEvent::TaskRejected { .. }
        ));
        assert_eq!(d.workers().get(&a).await.unwrap().counters.tasks_rejected, 1);
    }

    #[tokio::test]
    async fn test_expired_task_redispatched_once() {
        let config = DispatchConfig {
            max_retries: 1,
            ..Default::default()
        };
        let (d, _rx) = dispatcher_with(Arc::new(AcceptAll), config).await;
        d.register_worker(&peer("A"), Recipient::new([0; 32])).await.unwrap();
        let original = d
            .submit_task(TaskSpec::new("t", 1).with_time_limit(5))
            .await
            .unwrap();
        d.dispatch().await.unwrap();

        let later = Utc::now() + Duration::seconds(10);
        assert_eq!(d.sweep_expired(later).await, vec![original]);
        assert_eq!(
            d.store().get(original).await.unwrap().state.state,
            TaskState::Expired
        );

        let retry = d.dispatch().await.unwrap();
        assert_eq!(retry.len(), 1);
        let retry_id = retry[0].assignment.task_id;
        let retry_task = d.store().get(retry_id).await.unwrap().state;
        assert_eq!(retry_task.attempt, 1);
        assert_eq!(retry_task.retry_of, Some(original));

        // The retry itself expires for good.
        assert_eq!(d.sweep_expired(later).await, vec![retry_id]);
        assert!(d.dispatch().await.unwrap().is_empty());
        assert_eq!(d.backlog_len().await, 0);
    }

    #[tokio::test]
    async fn test_submission_after_expiry_is_rejected() {
        let (d, _rx) = dispatcher().await;
        let a = peer("A");
        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        let task_id = d
            .submit_task(TaskSpec::new("t", 1).with_time_limit(1))
            .await
            .unwrap();
        d.dispatch().await.unwrap();
        d.on_expire(task_id).await.unwrap();
        let err = d
            .on_submission(task_id, &a, serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::TaskExpired { .. }));
    }

    #[tokio::test]
    async fn test_banned_worker_is_never_dispatched() {
        let (d, _rx) = dispatcher().await;
        let (a, b) = (peer("A"), peer("B"));
        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        d.register_worker(&b, Recipient::new([0; 32])).await.unwrap();
        d.ban_worker(&a).await.unwrap();
        assert!(matches!(
            d.register_worker(&a, Recipient::new([0; 32])).await,
            Err(MeshError::WorkerBanned(_))
        ));

        for i in 0..3 {
            d.submit_task(TaskSpec::new(format!("t{i}"), 1)).await.unwrap();
        }
        let assigned = d.dispatch().await.unwrap();
        assert!(assigned.iter().all(|x| x.worker == b));

        d.unban_worker(&a).await.unwrap();
        assert!(d.queued_peers().await.contains(&a));
        assert!(!d.workers().get(&a).await.unwrap().banned);
    }

    #[tokio::test]
    async fn test_recover_requeues_created_tasks() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let store = Arc::new(TaskStore::open(kv.clone()).await.unwrap());
        store.create(TaskSpec::new("a", 1), 0, None).await.unwrap();
        store.create(TaskSpec::new("b", 1), 0, None).await.unwrap();

        let reopened = Arc::new(TaskStore::open(kv.clone()).await.unwrap());
        let d = TaskDispatcher::new(
            reopened,
            Arc::new(WorkerRegistry::new(kv)),
            Arc::new(AcceptAll),
            DispatchConfig::default(),
        );
        assert_eq!(d.recover().await.unwrap(), 2);
        assert_eq!(d.backlog_len().await, 2);
    }

    #[tokio::test]
    async fn test_oversized_time_limit_rejected() {
        let (d, _rx) = dispatcher().await;
        let err = d
            .submit_task(TaskSpec::new("t", 1).with_time_limit(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidTask(_)));
        assert_eq!(d.backlog_len().await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_caps_huge_time_limit_from_log() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let store = Arc::new(TaskStore::open(kv.clone()).await.unwrap());
        // Written before limits were checked at submission.
        store
            .create(TaskSpec::new("t", 1).with_time_limit(u64::MAX), 0, None)
            .await
            .unwrap();
        let d = TaskDispatcher::new(
            store,
            Arc::new(WorkerRegistry::new(kv)),
            Arc::new(AcceptAll),
            DispatchConfig::default(),
        );
        d.recover().await.unwrap();
        d.register_worker(&peer("A"), Recipient::new([0; 32])).await.unwrap();

        let before = Utc::now();
        let assigned = d.dispatch().await.unwrap();
        assert_eq!(assigned.len(), 1);
        let deadline = assigned[0].assignment.deadline.unwrap();
        assert!(deadline > before);
        assert!(deadline <= Utc::now() + Duration::seconds(MAX_TIME_LIMIT_SECS as i64));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Utc::now();
        assert_eq!(deadline_after(now, 30), now + Duration::seconds(30));
        assert_eq!(
            deadline_after(now, u64::MAX),
            deadline_after(now, MAX_TIME_LIMIT_SECS)
        );
        assert_eq!(
            deadline_after(DateTime::<Utc>::MAX_UTC, 1),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_task_in_backlog() {
        let flaky = Arc::new(FlakyStore::default());
        let kv: Arc<dyn KvStore> = flaky.clone();
        let store = Arc::new(TaskStore::open(kv.clone()).await.unwrap());
        let d = TaskDispatcher::new(
            store,
            Arc::new(WorkerRegistry::new(kv)),
            Arc::new(AcceptAll),
            DispatchConfig::default(),
        );
        d.register_worker(&peer("A"), Recipient::new([0; 32])).await.unwrap();
        let task_id = d.submit_task(TaskSpec::new("t", 1)).await.unwrap();

        flaky.fail_appends.store(true, Ordering::SeqCst);
        assert!(d.dispatch().await.unwrap().is_empty());
        assert_eq!(d.backlog_len().await, 1);
        assert_eq!(
            d.store().get(task_id).await.unwrap().state.state,
            TaskState::Created
        );

        flaky.fail_appends.store(false, Ordering::SeqCst);
        let assigned = d.dispatch().await.unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].assignment.task_id, task_id);
        assert_eq!(d.backlog_len().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_accept_counted_once() {
        let (d, _rx) = dispatcher().await;
        let a = peer("A");
        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        let task_id = d.submit_task(TaskSpec::new("t", 1)).await.unwrap();
        d.dispatch().await.unwrap();

        d.on_accept(task_id, &a).await.unwrap();
        d.on_accept(task_id, &a).await.unwrap();
        let counters = d.workers().get(&a).await.unwrap().counters;
        assert_eq!(counters.total_tasks, 1);
        assert_eq!(counters.tasks_accepted, 1);
        assert!(d.store().get(task_id).await.unwrap().state.accepted);
    }

    #[tokio::test]
    async fn test_unban_after_disconnect_waits_for_register() {
        let (d, _rx) = dispatcher().await;
        let a = peer("A");
        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        d.ban_worker(&a).await.unwrap();
        d.remove_peer(&a).await;

        d.unban_worker(&a).await.unwrap();
        assert!(d.queued_peers().await.is_empty());
        d.submit_task(TaskSpec::new("t", 1)).await.unwrap();
        assert!(d.dispatch().await.unwrap().is_empty());

        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        assert_eq!(d.dispatch().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submitted_task_expires_after_validation_window() {
        let config = DispatchConfig {
            validation_window_secs: 30,
            max_retries: 1,
            ..Default::default()
        };
        let (d, mut rx) = dispatcher_with(Arc::new(ExternalReview), config).await;
        let a = peer("A");
        d.register_worker(&a, Recipient::new([0; 32])).await.unwrap();
        let task_id = d.submit_task(TaskSpec::new("t", 1)).await.unwrap();
        d.dispatch().await.unwrap();
        d.on_submission(task_id, &a, serde_json::Value::Null)
            .await
            .unwrap();

        assert!(d.sweep_expired(Utc::now() + Duration::seconds(10)).await.is_empty());
        let expired = d.sweep_expired(Utc::now() + Duration::seconds(31)).await;
        assert_eq!(expired, vec![task_id]);
        assert_eq!(
            d.store().get(task_id).await.unwrap().state.state,
            TaskState::Expired
        );
        let DispatchEvent::TaskExpired { worker, retry, .. } = rx.recv().await.unwrap() else {
            panic!("expected an expiry event");
        };
        assert_eq!(worker, Some(a));
        assert!(retry.is_some());

        let err = d
            .on_validation_outcome(task_id, ValidationOutcome::Valid)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::TaskExpired { .. }));
    }
}
