//! Structured logging setup for the `coldchain` binary.
//!
//! Logs go to stderr so that stdout carries only JSON command envelopes.
//! `COLDCHAIN_LOG` takes precedence over the configured level and accepts any
//! `EnvFilter` directive (e.g. `coldchain::plugins::queue=debug`).
//!
//! Correlation fields used across the crate: `raw_id`, `job_id`,
//! `compressed_id`, `partition_key`, `node_id`, `entry_id`.

use crate::core::config::{LogConfig, LogFormat};
use crate::core::error::ColdchainError;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_ENV: &str = "COLDCHAIN_LOG";

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

pub fn init_logging(config: &LogConfig) -> Result<(), ColdchainError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| ColdchainError::Config(format!("invalid log filter: {}", e)))?;

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Pretty => builder.compact().try_init(),
    };
    installed.map_err(|e| ColdchainError::Config(format!("failed to install logger: {}", e)))?;

    let _ = LOGGING_INITIALIZED.set(());
    Ok(())
}
