use serde::{Deserialize, Serialize};
use std::time::Duration;

use taskmesh_types::{MeshError, Result};

/// Upper bound on any task time limit or validation window: ten years.
pub const MAX_TIME_LIMIT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Dispatcher timing and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Time limit for tasks whose spec does not set one.
    #[serde(default = "default_time_limit_secs")]
    pub default_time_limit_secs: u64,

    /// How long a submission may wait for a validation outcome.
    #[serde(default = "default_validation_window_secs")]
    pub validation_window_secs: u64,

    /// How many times an expired task is re-dispatched as a fresh attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Period of the expiry sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_time_limit_secs() -> u64 {
    60
}

fn default_validation_window_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    1
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_time_limit_secs: default_time_limit_secs(),
            validation_window_secs: default_validation_window_secs(),
            max_retries: default_max_retries(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(MeshError::Config("dispatch.sweep_interval_ms must be > 0".into()));
        }
        if self.default_time_limit_secs == 0 {
            return Err(MeshError::Config(
                "dispatch.default_time_limit_secs must be > 0".into(),
            ));
        }
        if self.default_time_limit_secs > MAX_TIME_LIMIT_SECS
            || self.validation_window_secs > MAX_TIME_LIMIT_SECS
        {
            return Err(MeshError::Config(format!(
                "dispatch time limits must not exceed {MAX_TIME_LIMIT_SECS}s"
            )));
        }
        Ok(())
    }
}
