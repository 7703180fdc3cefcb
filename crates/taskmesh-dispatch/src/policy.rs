use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use taskmesh_types::{Result, Task};

/// Outcome of checking a worker's submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Valid,
    Invalid { reason: String },
    /// The decision arrives later through `TaskDispatcher::on_validation_outcome`.
    Pending,
}

/// Pluggable validation hook consulted on every submission.
#[async_trait]
pub trait ValidationPolicy: Send + Sync {
    async fn validate(&self, task: &Task, result: &serde_json::Value) -> Result<ValidationOutcome>;

    fn name(&self) -> &str;
}

/// Accepts every submission.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl ValidationPolicy for AcceptAll {
    async fn validate(&self, _task: &Task, _result: &serde_json::Value) -> Result<ValidationOutcome> {
        Ok(ValidationOutcome::Valid)
    }

    fn name(&self) -> &str {
        "AcceptAll"
    }
}

/// Defers every decision to an external reviewer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalReview;

#[async_trait]
impl ValidationPolicy for ExternalReview {
    async fn validate(&self, _task: &Task, _result: &serde_json::Value) -> Result<ValidationOutcome> {
        Ok(ValidationOutcome::Pending)
    }

    fn name(&self) -> &str {
        "ExternalReview"
    }
}
