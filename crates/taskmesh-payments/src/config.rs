use serde::{Deserialize, Serialize};
use std::time::Duration;

use taskmesh_types::{MeshError, Result};

/// Settlement batching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Fixed arity of every batch proof. Changing it invalidates
    /// previously generated proofs.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on how long a credit waits before a partial batch is sealed.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Concurrent proof generations allowed on the blocking pool.
    #[serde(default = "default_proof_workers")]
    pub proof_workers: usize,
}

fn default_batch_size() -> usize {
    16
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_proof_workers() -> usize {
    2
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            proof_workers: default_proof_workers(),
        }
    }
}

impl PaymentConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MeshError::Config("payments.batch_size must be > 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(MeshError::Config(
                "payments.flush_interval_ms must be > 0".into(),
            ));
        }
        if self.proof_workers == 0 {
            return Err(MeshError::Config("payments.proof_workers must be > 0".into()));
        }
        Ok(())
    }
}
