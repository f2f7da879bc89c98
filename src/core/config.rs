//! Store configuration loaded from `coldchain.toml` in the store root.
//!
//! A missing file is not an error: every section has defaults. Environment
//! overrides are applied after the file is parsed.

use crate::core::error::ColdchainError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "coldchain.toml";
pub const NODE_ID_ENV: &str = "COLDCHAIN_NODE_ID";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub retention: RetentionConfig,
    pub queue: QueueConfig,
    pub partitions: PartitionConfig,
    pub audit: AuditConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days a record stays hot before it is scheduled for cold storage.
    pub hot_days: i64,
    /// Days (measured from creation) before a cold record is scheduled for deletion.
    pub cold_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            hot_days: 30,
            cold_days: 365,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: i64,
    /// Linear backoff: a failed job waits `retry_backoff_secs * attempts` before re-claim.
    pub retry_backoff_secs: i64,
    /// A job left in `processing` longer than this is eligible for `reclaim_stale`.
    pub stale_after_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff_secs: 0,
            stale_after_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PartitionConfig {
    /// Create the month partition on demand when a record is compressed.
    pub auto_create: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self { auto_create: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    pub node_id: String,
    /// Retries for pipeline stages that hit chain-lock contention.
    pub lock_retries: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            lock_retries: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, ColdchainError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ColdchainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ColdchainError> {
        if self.retention.hot_days <= 0 {
            return Err(ColdchainError::Config(
                "retention.hot_days must be positive".to_string(),
            ));
        }
        if self.retention.cold_days <= 0 {
            return Err(ColdchainError::Config(
                "retention.cold_days must be positive".to_string(),
            ));
        }
        if self.queue.max_attempts <= 0 {
            return Err(ColdchainError::Config(
                "queue.max_attempts must be positive".to_string(),
            ));
        }
        if self.queue.retry_backoff_secs < 0 || self.queue.stale_after_secs <= 0 {
            return Err(ColdchainError::Config(
                "queue.retry_backoff_secs must be >= 0 and queue.stale_after_secs > 0".to_string(),
            ));
        }
        if self.audit.node_id.trim().is_empty() {
            return Err(ColdchainError::Config(
                "audit.node_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(node) = std::env::var(NODE_ID_ENV) {
            if !node.trim().is_empty() {
                self.audit.node_id = node.trim().to_string();
            }
        }
    }
}

/// Load config from `<root>/coldchain.toml`, falling back to defaults.
pub fn load_config(root: &Path) -> Result<Config, ColdchainError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    let mut config = if config_path.exists() {
        let content = fs::read_to_string(&config_path).map_err(ColdchainError::Io)?;
        Config::parse(&content)?
    } else {
        Config::default()
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Write a `coldchain.toml` holding the defaults unless one already exists.
/// Returns whether a file was written.
pub fn write_default_config(root: &Path) -> Result<bool, ColdchainError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        return Ok(false);
    }
    let content = toml::to_string_pretty(&Config::default())
        .map_err(|e| ColdchainError::Config(e.to_string()))?;
    fs::create_dir_all(root).map_err(ColdchainError::Io)?;
    fs::write(&config_path, content).map_err(ColdchainError::Io)?;
    Ok(true)
}
