//! Encode worker loop.
//!
//! The codec itself lives outside this crate behind [`Compressor`]. A batch
//! run claims jobs, compresses each raw payload, commits the result, and
//! records job-level failures on the job row. Those failures come back inside
//! the [`BatchReport`] instead of as an `Err`; only storage failures abort the
//! batch.

use crate::core::error::ColdchainError;
use crate::core::store::Store;
use crate::plugins::audit;
use crate::plugins::compress;
use crate::plugins::intake;
use crate::plugins::queue::{self, FailureOutcome, JobView};

/// External codec executor.
pub trait Compressor: Send + Sync {
    /// Codec tag stored with every record this compressor produces.
    fn codec(&self) -> &str;

    fn compress(&self, mime_type: &str, payload: &[u8]) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    pub job_id: String,
    pub raw_id: String,
    pub compressed_id: String,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub claimed: usize,
    pub done: Vec<CompletedJob>,
    /// `RetryableProcessing` errors for jobs sent back to the queue.
    pub requeued: Vec<ColdchainError>,
    /// `TerminalProcessing` errors for jobs that exhausted their attempts.
    pub failed: Vec<ColdchainError>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Claim up to `limit` jobs and run each through `compressor`.
pub fn run_batch(
    store: &Store,
    compressor: &dyn Compressor,
    limit: usize,
) -> Result<BatchReport, ColdchainError> {
    let jobs = queue::claim_batch(store, limit)?;
    let mut report = BatchReport {
        claimed: jobs.len(),
        ..BatchReport::default()
    };

    for job in &jobs {
        match process_job(store, compressor, job)? {
            Ok(compressed_id) => {
                queue::mark_done(store, &job.job_id, &job.lease_id, &compressed_id)?;
                report.done.push(CompletedJob {
                    job_id: job.job_id.clone(),
                    raw_id: job.raw_id.clone(),
                    compressed_id,
                });
            }
            Err(message) => {
                let outcome = queue::mark_failed(store, &job.job_id, &job.lease_id, &message)?;
                let err = outcome.to_error(&job.job_id, &message);
                match outcome {
                    FailureOutcome::Requeued { .. } => report.requeued.push(err),
                    FailureOutcome::Failed { .. } => {
                        tracing::error!(job_id = %job.job_id, raw_id = %job.raw_id, error = %err, "encode job exhausted its attempts");
                        report.failed.push(err)
                    }
                }
            }
        }
    }

    tracing::info!(
        claimed = report.claimed,
        done = report.done.len(),
        requeued = report.requeued.len(),
        failed = report.failed.len(),
        "encode batch finished"
    );
    Ok(report)
}

/// Outer `Err` aborts the batch; inner `Err` is a job-level failure message.
fn process_job(
    store: &Store,
    compressor: &dyn Compressor,
    job: &JobView,
) -> Result<Result<String, String>, ColdchainError> {
    // A previous run may have committed the record but died before mark_done.
    if let Some(existing) = compress::compressed_id_for_raw(store, &job.raw_id)? {
        tracing::debug!(job_id = %job.job_id, compressed_id = %existing, "raw already compressed; completing job");
        return Ok(Ok(existing));
    }

    let raw = match intake::load_raw(store, &job.raw_id) {
        Ok(raw) => raw,
        Err(ColdchainError::NotFound(what)) => return Ok(Err(format!("not found: {}", what))),
        Err(e) => return Err(e),
    };
    let actual = audit::sha256_hex(&raw.payload);
    if actual != raw.checksum {
        let err = ColdchainError::Integrity {
            what: format!("raw record {}", raw.id),
            expected: raw.checksum.clone(),
            actual,
        };
        return Ok(Err(err.to_string()));
    }

    let bytes = match compressor.compress(&job.mime_type, &raw.payload) {
        Ok(bytes) => bytes,
        Err(message) => return Ok(Err(message)),
    };

    match compress::encode_raw_to_compressed(store, &job.raw_id, compressor.codec(), &bytes) {
        Ok(compressed_id) => Ok(Ok(compressed_id)),
        Err(ColdchainError::Conflict(message)) => {
            match compress::compressed_id_for_raw(store, &job.raw_id)? {
                Some(existing) => Ok(Ok(existing)),
                None => Ok(Err(message)),
            }
        }
        Err(e @ ColdchainError::Validation(_)) => Ok(Err(e.to_string())),
        Err(e) => Err(e),
    }
}
