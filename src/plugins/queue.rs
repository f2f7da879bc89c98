//! Durable encode job queue with lease-based batch claims.
//!
//! State machine:
//!
//! ```text
//! pending --claim--> processing --mark_done--> done
//!                    processing --mark_failed (attempts < max)--> pending
//!                    processing --mark_failed (attempts >= max)--> failed
//! ```
//!
//! A claim runs in one immediate transaction: it selects eligible pending
//! rows oldest first, then flips each one with a guarded
//! `UPDATE ... WHERE status = 'pending'` stamped with a fresh lease id. Only
//! rows the claimer actually flipped are returned, so two claimers can never
//! receive the same job and a claimer never waits on rows another worker owns.

use crate::core::error::ColdchainError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::audit::{self, AppendRequest, LifecycleEvent};
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ColdchainError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ColdchainError::Validation(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EncodeJob {
    pub id: String,
    pub raw_id: String,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub created_at: i64,
    pub last_attempt_at: Option<i64>,
    pub error: Option<String>,
    pub compressed_id: Option<String>,
    /// Lease of the worker currently holding the job; set only while `processing`.
    pub lease_id: Option<String>,
}

/// A claimed job as handed to a worker.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JobView {
    pub job_id: String,
    pub raw_id: String,
    /// Proof of ownership; required by `mark_done` and `mark_failed`.
    pub lease_id: String,
    pub mime_type: String,
    pub attempts: i64,
    pub max_attempts: i64,
}

/// Result of recording a failed attempt.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum FailureOutcome {
    /// Attempts remain; the job is pending again.
    Requeued { attempts: i64, max_attempts: i64 },
    /// Attempts exhausted; the job is terminally failed.
    Failed { attempts: i64 },
}

impl FailureOutcome {
    pub fn status(self) -> JobStatus {
        match self {
            FailureOutcome::Requeued { .. } => JobStatus::Pending,
            FailureOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    /// The error value a worker surfaces for this outcome.
    pub fn to_error(self, job_id: &str, message: &str) -> ColdchainError {
        match self {
            FailureOutcome::Requeued {
                attempts,
                max_attempts,
            } => ColdchainError::RetryableProcessing {
                job_id: job_id.to_string(),
                attempts,
                max_attempts,
                message: message.to_string(),
            },
            FailureOutcome::Failed { attempts } => ColdchainError::TerminalProcessing {
                job_id: job_id.to_string(),
                attempts,
                message: message.to_string(),
            },
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
}

const LEASE_EXPIRED: &str = "lease expired: worker did not report within stale_after_secs";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<(EncodeJob, String)> {
    let status: String = row.get(2)?;
    Ok((
        EncodeJob {
            id: row.get(0)?,
            raw_id: row.get(1)?,
            status: JobStatus::Pending,
            attempts: row.get(3)?,
            max_attempts: row.get(4)?,
            created_at: row.get(5)?,
            last_attempt_at: row.get(6)?,
            error: row.get(7)?,
            compressed_id: row.get(8)?,
            lease_id: row.get(9)?,
        },
        status,
    ))
}

fn load_job(conn: &Connection, job_id: &str) -> Result<EncodeJob, ColdchainError> {
    let found = conn
        .query_row(
            "SELECT id, raw_id, status, attempts, max_attempts, created_at, last_attempt_at, error, compressed_id, lease_id
             FROM encode_jobs WHERE id = ?1",
            [job_id],
            row_to_job,
        )
        .optional()?;
    let (mut job, status) =
        found.ok_or_else(|| ColdchainError::NotFound(format!("encode job {}", job_id)))?;
    job.status = JobStatus::parse(&status)?;
    Ok(job)
}

pub fn get_job(store: &Store, job_id: &str) -> Result<EncodeJob, ColdchainError> {
    store
        .broker()
        .with_read("queue.get", |conn| load_job(conn, job_id))
}

pub fn enqueue(store: &Store, raw_id: &str) -> Result<String, ColdchainError> {
    let job_id = time::new_id();
    let now = store.now();
    let max_attempts = store.config.queue.max_attempts;

    store.broker().with_write("queue.enqueue", |tx| {
        let processed: Option<bool> = tx
            .query_row(
                "SELECT processed FROM raw_records WHERE id = ?1",
                [raw_id],
                |row| row.get(0),
            )
            .optional()?;
        match processed {
            None => return Err(ColdchainError::NotFound(format!("raw record {}", raw_id))),
            Some(true) => {
                return Err(ColdchainError::Conflict(format!(
                    "raw record {} is already processed",
                    raw_id
                )));
            }
            Some(false) => {}
        }
        tx.execute(
            "INSERT INTO encode_jobs(id, raw_id, status, attempts, max_attempts, created_at)
             VALUES(?1, ?2, 'pending', 0, ?3, ?4)",
            params![job_id, raw_id, max_attempts, now],
        )?;
        Ok(())
    })?;

    tracing::info!(job_id = %job_id, raw_id, "encode job enqueued");
    Ok(job_id)
}

/// Claim up to `limit` pending jobs for one worker, oldest first.
pub fn claim_batch(store: &Store, limit: usize) -> Result<Vec<JobView>, ColdchainError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let lease_id = time::new_id();
    let now = store.now();
    let backoff = store.config.queue.retry_backoff_secs;

    let claimed = store.broker().with_write("queue.claim", |tx| {
        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM encode_jobs
                 WHERE status = 'pending'
                   AND attempts < max_attempts
                   AND (last_attempt_at IS NULL OR last_attempt_at + ?1 * attempts <= ?2)
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![backoff, now, limit as i64], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for job_id in &candidates {
            tx.execute(
                "UPDATE encode_jobs
                 SET status = 'processing', attempts = attempts + 1, last_attempt_at = ?1, lease_id = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![now, lease_id, job_id],
            )?;
        }

        let mut stmt = tx.prepare(
            "SELECT j.id, j.raw_id, j.lease_id, r.mime_type, j.attempts, j.max_attempts
             FROM encode_jobs j JOIN raw_records r ON r.id = j.raw_id
             WHERE j.lease_id = ?1 AND j.status = 'processing'
             ORDER BY j.created_at ASC, j.rowid ASC",
        )?;
        let rows = stmt.query_map([&lease_id], |row| {
            Ok(JobView {
                job_id: row.get(0)?,
                raw_id: row.get(1)?,
                lease_id: row.get(2)?,
                mime_type: row.get(3)?,
                attempts: row.get(4)?,
                max_attempts: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    })?;

    if !claimed.is_empty() {
        tracing::debug!(lease_id = %lease_id, claimed = claimed.len(), "claimed encode batch");
    }
    Ok(claimed)
}

fn require_processing(job: &EncodeJob, op: &str) -> Result<(), ColdchainError> {
    if job.status != JobStatus::Processing {
        return Err(ColdchainError::Conflict(format!(
            "cannot {} job {}: status is {}",
            op,
            job.id,
            job.status.as_str()
        )));
    }
    Ok(())
}

/// A report for a processing job is only accepted from the lease that claimed it.
fn require_lease(job: &EncodeJob, lease_id: &str) -> Result<(), ColdchainError> {
    if job.lease_id.as_deref() != Some(lease_id) {
        return Err(ColdchainError::Conflict(format!(
            "lease {} does not hold job {}",
            lease_id, job.id
        )));
    }
    Ok(())
}

/// Finish a claimed job: status `done`, raw record marked processed.
/// Repeating the call with the same compressed id is a no-op.
pub fn mark_done(
    store: &Store,
    job_id: &str,
    lease_id: &str,
    compressed_id: &str,
) -> Result<(), ColdchainError> {
    audit::audited_write(store, "queue.done", |tx| {
        let job = load_job(tx, job_id)?;
        if job.status == JobStatus::Done && job.compressed_id.as_deref() == Some(compressed_id) {
            return Ok(((), Vec::new()));
        }
        require_processing(&job, "complete")?;
        require_lease(&job, lease_id)?;

        let compressed_raw: Option<String> = tx
            .query_row(
                "SELECT raw_id FROM compressed_locator WHERE id = ?1",
                [compressed_id],
                |row| row.get(0),
            )
            .optional()?;
        match compressed_raw {
            None => {
                return Err(ColdchainError::NotFound(format!(
                    "compressed record {}",
                    compressed_id
                )));
            }
            Some(raw) if raw != job.raw_id => {
                return Err(ColdchainError::Conflict(format!(
                    "compressed record {} belongs to raw {}, not {}",
                    compressed_id, raw, job.raw_id
                )));
            }
            Some(_) => {}
        }

        let finished = tx.execute(
            "UPDATE encode_jobs SET status = 'done', compressed_id = ?1, error = NULL, lease_id = NULL
             WHERE id = ?2 AND lease_id = ?3 AND status = 'processing'",
            params![compressed_id, job_id, lease_id],
        )?;
        if finished != 1 {
            return Err(ColdchainError::Conflict(format!(
                "lease {} lost job {}",
                lease_id, job_id
            )));
        }
        tx.execute(
            "UPDATE raw_records SET processed = 1 WHERE id = ?1",
            [&job.raw_id],
        )?;

        let ev = AppendRequest::system(
            LifecycleEvent::JobCompleted {
                job_id: job_id.to_string(),
                raw_id: job.raw_id.clone(),
                compressed_id: compressed_id.to_string(),
            },
            "queue",
        );
        Ok(((), vec![ev]))
    })?;
    tracing::info!(job_id, compressed_id, "encode job done");
    Ok(())
}

/// Record a failed attempt. The job returns to `pending` while attempts
/// remain and becomes terminally `failed` once they are exhausted.
pub fn mark_failed(
    store: &Store,
    job_id: &str,
    lease_id: &str,
    error_msg: &str,
) -> Result<FailureOutcome, ColdchainError> {
    let outcome = audit::audited_write(store, "queue.fail", |tx| {
        let job = load_job(tx, job_id)?;
        require_processing(&job, "fail")?;
        require_lease(&job, lease_id)?;
        let (outcome, events) = fail_in_tx(tx, &job, error_msg)?;
        Ok((outcome, events))
    })?;

    match outcome {
        FailureOutcome::Requeued {
            attempts,
            max_attempts,
        } => tracing::info!(job_id, attempts, max_attempts, error = error_msg, "encode job requeued"),
        FailureOutcome::Failed { attempts } => {
            tracing::warn!(job_id, attempts, error = error_msg, "encode job failed permanently")
        }
    }
    Ok(outcome)
}

fn fail_in_tx(
    conn: &Connection,
    job: &EncodeJob,
    error_msg: &str,
) -> Result<(FailureOutcome, Vec<AppendRequest>), ColdchainError> {
    if job.attempts >= job.max_attempts {
        conn.execute(
            "UPDATE encode_jobs SET status = 'failed', error = ?1, lease_id = NULL WHERE id = ?2",
            params![error_msg, job.id],
        )?;
        let ev = AppendRequest::system(
            LifecycleEvent::JobFailed {
                job_id: job.id.clone(),
                raw_id: job.raw_id.clone(),
                attempts: job.attempts,
                error: error_msg.to_string(),
            },
            "queue",
        );
        Ok((
            FailureOutcome::Failed {
                attempts: job.attempts,
            },
            vec![ev],
        ))
    } else {
        conn.execute(
            "UPDATE encode_jobs SET status = 'pending', error = ?1, lease_id = NULL WHERE id = ?2",
            params![error_msg, job.id],
        )?;
        Ok((
            FailureOutcome::Requeued {
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            },
            Vec::new(),
        ))
    }
}

/// Return jobs stuck in `processing` past `queue.stale_after_secs` to the
/// queue, or fail them when their attempts are spent.
pub fn reclaim_stale(store: &Store) -> Result<ReclaimReport, ColdchainError> {
    let cutoff = store.now() - store.config.queue.stale_after_secs;
    let report = audit::audited_write(store, "queue.reclaim", |tx| {
        let stale: Vec<EncodeJob> = {
            let mut stmt = tx.prepare(
                "SELECT id, raw_id, status, attempts, max_attempts, created_at, last_attempt_at, error, compressed_id, lease_id
                 FROM encode_jobs
                 WHERE status = 'processing' AND last_attempt_at <= ?1
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map([cutoff], row_to_job)?;
            let mut out = Vec::new();
            for r in rows {
                let (mut job, _) = r?;
                job.status = JobStatus::Processing;
                out.push(job);
            }
            out
        };

        let mut report = ReclaimReport::default();
        let mut events = Vec::new();
        for job in &stale {
            let (outcome, mut evs) = fail_in_tx(tx, job, LEASE_EXPIRED)?;
            match outcome {
                FailureOutcome::Requeued { .. } => report.requeued.push(job.id.clone()),
                FailureOutcome::Failed { .. } => report.failed.push(job.id.clone()),
            }
            events.append(&mut evs);
        }
        Ok((report, events))
    })?;

    if !report.requeued.is_empty() || !report.failed.is_empty() {
        tracing::warn!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "reclaimed stale encode jobs"
        );
    }
    Ok(report)
}

pub fn queue_stats(store: &Store) -> Result<QueueStats, ColdchainError> {
    store.broker().with_read("queue.stats", |conn| {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM encode_jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut stats = QueueStats::default();
        for r in rows {
            let (status, count) = r?;
            match JobStatus::parse(&status)? {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Done => stats.done = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    })
}

#[derive(Parser, Debug)]
#[clap(name = "queue", about = "Operate the encode job queue.")]
pub struct QueueCli {
    #[clap(subcommand)]
    pub command: QueueCommand,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// Enqueue an encode job for a raw record.
    Enqueue {
        #[clap(long)]
        raw: String,
    },
    /// Claim a batch of pending jobs.
    Claim {
        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
    /// Mark a claimed job done.
    Done {
        #[clap(long)]
        job: String,
        #[clap(long)]
        lease: String,
        #[clap(long)]
        compressed: String,
    },
    /// Record a failed attempt for a claimed job.
    Fail {
        #[clap(long)]
        job: String,
        #[clap(long)]
        lease: String,
        #[clap(long)]
        error: String,
    },
    /// Return stale processing jobs to the queue.
    Reclaim,
    /// Show one job.
    Show {
        #[clap(long)]
        job: String,
    },
    /// Job counts by status.
    Stats,
}

pub fn run_queue_cli(store: &Store, cli: QueueCli) -> Result<serde_json::Value, ColdchainError> {
    match cli.command {
        QueueCommand::Enqueue { raw } => {
            let job_id = enqueue(store, &raw)?;
            Ok(time::command_envelope(
                "queue.enqueue",
                "ok",
                serde_json::json!({ "job_id": job_id, "raw_id": raw }),
            ))
        }
        QueueCommand::Claim { limit } => {
            let jobs = claim_batch(store, limit)?;
            Ok(time::command_envelope(
                "queue.claim",
                "ok",
                serde_json::json!({ "jobs": jobs }),
            ))
        }
        QueueCommand::Done {
            job,
            lease,
            compressed,
        } => {
            mark_done(store, &job, &lease, &compressed)?;
            Ok(time::command_envelope(
                "queue.done",
                "ok",
                serde_json::json!({ "job_id": job, "compressed_id": compressed }),
            ))
        }
        QueueCommand::Fail { job, lease, error } => {
            let outcome = mark_failed(store, &job, &lease, &error)?;
            Ok(time::command_envelope(
                "queue.fail",
                outcome.status().as_str(),
                serde_json::json!({ "job_id": job, "result": outcome }),
            ))
        }
        QueueCommand::Reclaim => {
            let report = reclaim_stale(store)?;
            Ok(time::command_envelope(
                "queue.reclaim",
                "ok",
                serde_json::json!({ "result": report }),
            ))
        }
        QueueCommand::Show { job } => {
            let job = get_job(store, &job)?;
            Ok(time::command_envelope(
                "queue.show",
                "ok",
                serde_json::json!({ "job": job }),
            ))
        }
        QueueCommand::Stats => {
            let stats = queue_stats(store)?;
            Ok(time::command_envelope(
                "queue.stats",
                "ok",
                serde_json::json!({ "stats": stats }),
            ))
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "queue",
        "version": "0.1.0",
        "description": "Durable encode job queue with lease-based claims and bounded retries",
        "commands": [
            { "name": "enqueue", "parameters": ["raw"] },
            { "name": "claim", "parameters": ["limit"] },
            { "name": "done", "parameters": ["job", "lease", "compressed"] },
            { "name": "fail", "parameters": ["job", "lease", "error"] },
            { "name": "reclaim", "parameters": [] },
            { "name": "show", "parameters": ["job"] },
            { "name": "stats", "parameters": [] }
        ],
        "storage": ["coldchain.db:encode_jobs"]
    })
}
