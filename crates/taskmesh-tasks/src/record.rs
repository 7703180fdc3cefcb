use serde::{Deserialize, Serialize};

use taskmesh_types::{MeshError, Result, Task, TaskEvent, TaskId};

/// A task's append-only event log together with its folded snapshot.
///
/// `state` is always `fold(events)`; the only way to change either is
/// [`TaskRecord::apply`], which validates before appending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub state: Task,
    pub events: Vec<TaskEvent>,
}

impl TaskRecord {
    /// Start a record from its `Created` event.
    pub fn new(task_id: TaskId, created: TaskEvent) -> Result<Self> {
        let state = Task::from_created(task_id, &created)?;
        Ok(Self {
            state,
            events: vec![created],
        })
    }

    /// Rebuild a record by replaying its log.
    pub fn replay(task_id: TaskId, events: Vec<TaskEvent>) -> Result<Self> {
        let state = fold(task_id, &events)?;
        Ok(Self { state, events })
    }

    /// Validate `event` against the current state and append it.
    /// On error neither the snapshot nor the log changes.
    pub fn apply(&mut self, event: TaskEvent) -> Result<()> {
        let mut next = self.state.clone();
        next.apply(&event)?;
        self.state = next;
        self.events.push(event);
        Ok(())
    }

    pub fn id(&self) -> TaskId {
        self.state.id
    }
}

/// Pure reducer: derive the task snapshot from its events in order.
pub fn fold(task_id: TaskId, events: &[TaskEvent]) -> Result<Task> {
    let (first, rest) = events
        .split_first()
        .ok_or(MeshError::TaskNotFound(task_id))?;
    let mut task = Task::from_created(task_id, first)?;
    for event in rest {
        task.apply(event)?;
    }
    Ok(task)
}
