use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use taskmesh_dispatch::DispatchConfig;
use taskmesh_payments::PaymentConfig;

/// Top-level configuration for a taskmesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub log_json: bool,

    /// Capacity of the in-process message and event channels.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub payments: PaymentConfig,
}

fn default_channel_capacity() -> usize {
    1_024
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_json: false,
            channel_capacity: default_channel_capacity(),
            dispatch: DispatchConfig::default(),
            payments: PaymentConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Config file path within the state directory.
    pub fn config_path(state_dir: &Path) -> PathBuf {
        state_dir.join("taskmesh.toml")
    }

    /// Load config from disk. Returns default if not found.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::config_path(state_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to disk.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let path = Self::config_path(state_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be > 0");
        }
        self.dispatch.validate()?;
        self.payments.validate()?;
        Ok(())
    }
}
