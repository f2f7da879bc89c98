//! The DB Broker is the "thin waist" for state access.
//!
//! - Write operations are serialized per database through an in-process mutex
//!   and run inside a `BEGIN IMMEDIATE` transaction on a fresh connection.
//!   The transaction commits when the closure returns `Ok` and rolls back
//!   otherwise.
//! - Read operations open a fresh connection with no mutex (WAL allows
//!   concurrent readers across threads and processes).
//! - Cross-process writers are arbitrated by SQLite's `busy_timeout`.
//!
//! Connections are not pooled; every call opens its own so that child
//! processes and other tools can share the same file safely.

use crate::core::db;
use crate::core::error::ColdchainError;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Write connection busy_timeout in seconds.
const WRITE_BUSY_TIMEOUT_SECS: u64 = 5;
/// Read connection busy_timeout in seconds.
const READ_BUSY_TIMEOUT_SECS: u64 = 5;
/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 5;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 500;

#[derive(Debug)]
pub struct DbBroker {
    db_path: PathBuf,
    write_lock: Mutex<()>,
}

impl DbBroker {
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Execute a closure inside an immediate write transaction.
    pub fn with_write<F, R>(&self, op: &str, f: F) -> Result<R, ColdchainError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, ColdchainError>,
    {
        let started = Instant::now();
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ColdchainError::Validation("broker write lock poisoned".to_string()))?;

        let mut conn = db::db_connect(
            &self.db_path.to_string_lossy(),
            Duration::from_secs(WRITE_BUSY_TIMEOUT_SECS),
        )?;
        let result = run_in_transaction(&mut conn, f);
        self.log_op(op, "write", &result, started);
        result
    }

    /// Execute a closure with a read connection (no mutex serialization).
    pub fn with_read<F, R>(&self, op: &str, f: F) -> Result<R, ColdchainError>
    where
        F: FnOnce(&Connection) -> Result<R, ColdchainError>,
    {
        let started = Instant::now();
        let conn = db::db_connect(
            &self.db_path.to_string_lossy(),
            Duration::from_secs(READ_BUSY_TIMEOUT_SECS),
        )?;
        let result = f(&conn);
        self.log_op(op, "read", &result, started);
        result
    }

    fn log_op<R>(&self, op: &str, mode: &str, result: &Result<R, ColdchainError>, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => tracing::debug!(op, mode, status = "success", elapsed_ms, "broker op"),
            Err(e) => tracing::debug!(
                op,
                mode,
                status = "error",
                code = e.code(),
                elapsed_ms,
                "broker op"
            ),
        }
    }
}

fn run_in_transaction<F, R>(conn: &mut Connection, f: F) -> Result<R, ColdchainError>
where
    F: FnOnce(&Transaction<'_>) -> Result<R, ColdchainError>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Delay before retry number `attempt` (1-based), doubling from
/// `BASE_DELAY_MS` up to `MAX_DELAY_MS`.
fn backoff_delay_ms(attempt: u32) -> u64 {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS)
}

/// Retry a closure on retryable errors (lock contention, `SQLITE_BUSY`) with
/// exponential backoff. The last error is returned once `max_retries` is spent.
pub fn retry_with_backoff<F, R>(max_retries: u32, mut f: F) -> Result<R, ColdchainError>
where
    F: FnMut() -> Result<R, ColdchainError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let delay_ms = backoff_delay_ms(attempt);
                tracing::debug!(attempt, delay_ms, error = %e, "retrying after contention");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}
