use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ColdchainError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Audit chain lock for node '{node_id}' is held by another writer; retry")]
    LockContention { node_id: String },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Job {job_id} failed (attempt {attempts}/{max_attempts}), requeued: {message}")]
    RetryableProcessing {
        job_id: String,
        attempts: i64,
        max_attempts: i64,
        message: String,
    },
    #[error("Job {job_id} failed permanently after {attempts} attempts: {message}")]
    TerminalProcessing {
        job_id: String,
        attempts: i64,
        message: String,
    },
    #[error("Integrity error on {what}: expected {expected}, found {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },
}

impl ColdchainError {
    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            ColdchainError::LockContention { .. } => true,
            ColdchainError::RetryableProcessing { .. } => true,
            ColdchainError::Storage(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Stable machine-readable code used in CLI envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ColdchainError::Storage(_) => "storage_error",
            ColdchainError::Io(_) => "io_error",
            ColdchainError::Serialization(_) => "serialization_error",
            ColdchainError::Config(_) => "config_error",
            ColdchainError::Validation(_) => "validation_error",
            ColdchainError::Conflict(_) => "conflict",
            ColdchainError::LockContention { .. } => "lock_contention",
            ColdchainError::NotFound(_) => "not_found",
            ColdchainError::RetryableProcessing { .. } => "retryable_processing_error",
            ColdchainError::TerminalProcessing { .. } => "terminal_processing_error",
            ColdchainError::Integrity { .. } => "integrity_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ColdchainError>;
