use thiserror::Error;

use crate::ids::{PeerId, TaskId};
use crate::task::TaskState;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Illegal transition for task {task_id}: cannot apply {event} in state {from:?}")]
    TaskValidation {
        task_id: TaskId,
        from: Option<TaskState>,
        event: &'static str,
    },

    #[error("Task {task_id} is already terminal ({state:?})")]
    TaskExpired { task_id: TaskId, state: TaskState },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(PeerId),

    #[error("Worker is banned: {0}")]
    WorkerBanned(PeerId),

    #[error("Task {task_id} is not assigned to worker {worker}")]
    NotAssigned { task_id: TaskId, worker: PeerId },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Payment rejected: {0}")]
    PaymentRejected(String),

    #[error("Proof generation failed: {0}")]
    ProofGeneration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport '{0}' registered more than once")]
    DuplicateTransport(&'static str),

    #[error("Transport '{name}' failed to initialize: {reason}")]
    TransportInit { name: &'static str, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
