use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::ids::{Recipient, TaskId};
use crate::payment::SignedPayment;
use crate::task::Task;

/// The part of a task a worker needs in order to execute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub template_id: String,
    pub template_data: serde_json::Value,
    pub reward: u64,
    pub deadline: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskAssignment {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            template_id: task.spec.template_id.clone(),
            template_data: task.spec.template_data.clone(),
            reward: task.spec.reward,
            deadline: task.deadline,
        }
    }
}

/// Worker -> manager messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Register { recipient: Recipient },
    Accept { task_id: TaskId },
    Submit {
        task_id: TaskId,
        result: serde_json::Value,
    },
    Disconnect,
}

/// Manager -> worker messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    AssignTask { assignment: TaskAssignment },
    Payment {
        payment: SignedPayment,
        batch_id: Uuid,
    },
    Banned,
}

impl WorkerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl ManagerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
