use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::record::TaskRecord;
use taskmesh_storage::{KvStore, key_suffix, namespaced_key};
use taskmesh_types::{
    MeshError, Result, TaskEvent, TaskEventKind, TaskId, TaskSpec, TaskState,
};

const TASK_NAMESPACE: &str = "task";

/// `None` marks a slot reserved by an in-flight first append.
type Slot = Arc<Mutex<Option<TaskRecord>>>;

/// Event-sourced task store.
///
/// Every task's log is persisted to the shared [`KvStore`] before the
/// in-memory record changes, so [`TaskStore::open`] can always rebuild the
/// exact state by replaying logs. Appends to one task are serialized by that
/// task's mutex; different tasks append concurrently.
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
    records: DashMap<TaskId, Slot>,
}

impl TaskStore {
    /// Open the store, replaying every persisted task log.
    pub async fn open(kv: Arc<dyn KvStore>) -> Result<Self> {
        let records = DashMap::new();
        let prefix = format!("{TASK_NAMESPACE}/");
        for key in kv.keys_with_prefix(prefix.as_bytes()).await? {
            let Some(task_id) = key_suffix(TASK_NAMESPACE, &key).and_then(|s| s.parse::<Uuid>().ok())
            else {
                tracing::warn!(key = %String::from_utf8_lossy(&key), "skipping unrecognised task key");
                continue;
            };
            let events = kv
                .read_log(&key)
                .await?
                .iter()
                .map(|raw| serde_json::from_slice::<TaskEvent>(raw))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let record = TaskRecord::replay(task_id, events)?;
            records.insert(task_id, Arc::new(Mutex::new(Some(record))));
        }
        tracing::info!(tasks = records.len(), "task store recovered");
        Ok(Self { kv, records })
    }

    /// Record a new task and return its folded record.
    pub async fn create(
        &self,
        spec: TaskSpec,
        attempt: u32,
        retry_of: Option<TaskId>,
    ) -> Result<TaskRecord> {
        let task_id = Uuid::new_v4();
        self.append(
            task_id,
            TaskEvent::new(TaskEventKind::Created {
                spec,
                attempt,
                retry_of,
            }),
        )
        .await
    }

    /// Validate and append an event, returning the updated record.
    ///
    /// Fails with `TaskValidation` for an illegal transition, `TaskExpired`
    /// when the task is already terminal, and `TaskNotFound` when a non-`Created`
    /// event targets an unknown task. A failed append changes nothing.
    pub async fn append(&self, task_id: TaskId, event: TaskEvent) -> Result<TaskRecord> {
        let slot = self
            .records
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut guard = slot.lock().await;

        let next = match guard.as_ref() {
            Some(record) => {
                let mut next = record.clone();
                next.apply(event.clone())?;
                Some(next)
            }
            None if matches!(event.kind, TaskEventKind::Created { .. }) => {
                Some(TaskRecord::new(task_id, event.clone())?)
            }
            None => None,
        };
        let Some(next) = next else {
            drop(guard);
            drop(slot);
            self.release_empty_slot(task_id).await;
            return Err(MeshError::TaskNotFound(task_id));
        };

        let raw = serde_json::to_vec(&event)?;
        if let Err(e) = self
            .kv
            .append(&namespaced_key(TASK_NAMESPACE, task_id), raw)
            .await
        {
            tracing::error!(%task_id, event = event.kind.name(), error = %e, "failed to persist task event");
            let was_empty = guard.is_none();
            drop(guard);
            drop(slot);
            if was_empty {
                self.release_empty_slot(task_id).await;
            }
            return Err(e);
        }

        tracing::debug!(%task_id, event = event.kind.name(), state = ?next.state.state, "task event appended");
        *guard = Some(next.clone());
        Ok(next)
    }

    /// Current folded record of a task.
    pub async fn get(&self, task_id: TaskId) -> Result<TaskRecord> {
        let slot = self
            .records
            .get(&task_id)
            .map(|s| s.value().clone())
            .ok_or(MeshError::TaskNotFound(task_id))?;
        let guard = slot.lock().await;
        guard.clone().ok_or(MeshError::TaskNotFound(task_id))
    }

    /// All tasks whose folded state is not terminal.
    pub async fn list_active(&self) -> Vec<TaskRecord> {
        self.collect(|r| !r.state.state.is_terminal()).await
    }

    pub async fn list_by_state(&self, state: TaskState) -> Vec<TaskRecord> {
        self.collect(|r| r.state.state == state).await
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn collect(&self, keep: impl Fn(&TaskRecord) -> bool) -> Vec<TaskRecord> {
        // Never hold a map guard across an await.
        let slots: Vec<Slot> = self.records.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for slot in slots {
            if let Some(record) = slot.lock().await.as_ref() {
                if keep(record) {
                    out.push(record.clone());
                }
            }
        }
        out.sort_by_key(|r| r.state.created_at);
        out
    }

    async fn release_empty_slot(&self, task_id: TaskId) {
        let slot = match self.records.get(&task_id) {
            Some(s) => s.value().clone(),
            None => return,
        };
        let empty = slot.lock().await.is_none();
        if empty {
            self.records
                .remove_if(&task_id, |_, s| Arc::ptr_eq(s, &slot) && Arc::strong_count(s) <= 2);
        }
    }
}
