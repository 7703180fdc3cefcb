use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};
use crate::ids::{PeerId, TaskId};

/// What a task-producing collaborator hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub template_id: String,
    pub template_data: serde_json::Value,
    pub reward: u64,
    /// Seconds a worker has between assignment and submission.
    /// `None` falls back to the dispatcher's configured default.
    pub time_limit_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(template_id: impl Into<String>, reward: u64) -> Self {
        Self {
            template_id: template_id.into(),
            template_data: serde_json::Value::Null,
            reward,
            time_limit_secs: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.template_data = data;
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit_secs = Some(secs);
        self
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Assigned,
    Submitted,
    Validated,
    Rejected,
    Expired,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Validated | TaskState::Rejected | TaskState::Expired
        )
    }

    /// Attempt a state transition given an event.
    /// Returns the new state or an error if the transition is invalid.
    pub fn transition(self, task_id: TaskId, event: &TaskEventKind) -> Result<TaskState> {
        if self.is_terminal() {
            return Err(MeshError::TaskExpired {
                task_id,
                state: self,
            });
        }
        match (self, event) {
            (TaskState::Created, TaskEventKind::Assigned { .. }) => Ok(TaskState::Assigned),

            (TaskState::Assigned, TaskEventKind::Accepted) => Ok(TaskState::Assigned),
            (TaskState::Assigned, TaskEventKind::Submitted { .. }) => Ok(TaskState::Submitted),
            (TaskState::Assigned, TaskEventKind::Expired) => Ok(TaskState::Expired),

            (TaskState::Submitted, TaskEventKind::Validated) => Ok(TaskState::Validated),
            (TaskState::Submitted, TaskEventKind::Rejected { .. }) => Ok(TaskState::Rejected),
            (TaskState::Submitted, TaskEventKind::Expired) => Ok(TaskState::Expired),

            (state, event) => Err(MeshError::TaskValidation {
                task_id,
                from: Some(state),
                event: event.name(),
            }),
        }
    }
}

/// Typed lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEventKind {
    Created {
        spec: TaskSpec,
        attempt: u32,
        retry_of: Option<TaskId>,
    },
    Assigned {
        worker: PeerId,
        deadline: DateTime<Utc>,
    },
    /// The assignee confirmed it is working on the task. Does not change state.
    Accepted,
    Submitted {
        result: serde_json::Value,
        validation_deadline: DateTime<Utc>,
    },
    Validated,
    Rejected {
        reason: String,
    },
    Expired,
}

impl TaskEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEventKind::Created { .. } => "Created",
            TaskEventKind::Assigned { .. } => "Assigned",
            TaskEventKind::Accepted => "Accepted",
            TaskEventKind::Submitted { .. } => "Submitted",
            TaskEventKind::Validated => "Validated",
            TaskEventKind::Rejected { .. } => "Rejected",
            TaskEventKind::Expired => "Expired",
        }
    }
}

/// A lifecycle event with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
        }
    }

    pub fn at(kind: TaskEventKind, at: DateTime<Utc>) -> Self {
        Self { kind, at }
    }
}

/// Snapshot of a task, always derived from its event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub assignee: Option<PeerId>,
    /// Whether the assignee has acknowledged the assignment.
    #[serde(default)]
    pub accepted: bool,
    /// Time limit while `Assigned`, validation window end while `Submitted`.
    pub deadline: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub rejection_reason: Option<String>,
    pub attempt: u32,
    pub retry_of: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build the initial snapshot from a task's first event, which must be `Created`.
    pub fn from_created(id: TaskId, event: &TaskEvent) -> Result<Self> {
        match &event.kind {
            TaskEventKind::Created {
                spec,
                attempt,
                retry_of,
            } => Ok(Self {
                id,
                spec: spec.clone(),
                state: TaskState::Created,
                assignee: None,
                accepted: false,
                deadline: None,
                result: None,
                rejection_reason: None,
                attempt: *attempt,
                retry_of: *retry_of,
                created_at: event.at,
                updated_at: event.at,
            }),
            other => Err(MeshError::TaskValidation {
                task_id: id,
                from: None,
                event: other.name(),
            }),
        }
    }

    /// Apply a state transition event.
    pub fn apply(&mut self, event: &TaskEvent) -> Result<()> {
        if matches!(event.kind, TaskEventKind::Created { .. }) && !self.state.is_terminal() {
            return Err(MeshError::TaskValidation {
                task_id: self.id,
                from: Some(self.state),
                event: event.kind.name(),
            });
        }
        if matches!(event.kind, TaskEventKind::Accepted) && self.accepted {
            return Err(MeshError::TaskValidation {
                task_id: self.id,
                from: Some(self.state),
                event: event.kind.name(),
            });
        }
        self.state = self.state.transition(self.id, &event.kind)?;
        match &event.kind {
            TaskEventKind::Assigned { worker, deadline } => {
                self.assignee = Some(worker.clone());
                self.deadline = Some(*deadline);
            }
            TaskEventKind::Accepted => self.accepted = true,
            TaskEventKind::Submitted {
                result,
                validation_deadline,
            } => {
                self.result = Some(result.clone());
                self.deadline = Some(*validation_deadline);
            }
            TaskEventKind::Rejected { reason } => {
                self.rejection_reason = Some(reason.clone());
                self.deadline = None;
            }
            TaskEventKind::Validated | TaskEventKind::Expired => {
                self.deadline = None;
            }
            TaskEventKind::Created { .. } => {}
        }
        self.updated_at = event.at;
        Ok(())
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && self.deadline.is_some_and(|d| d <= now)
    }
}
