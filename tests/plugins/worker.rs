use coldchain::core::config::Config;
use coldchain::core::error::ColdchainError;
use coldchain::core::store::Store;
use coldchain::core::time::ManualClock;
use coldchain::plugins::compress::{encode_raw_to_compressed, fetch_compressed, get_compressed};
use coldchain::plugins::intake::intake;
use coldchain::plugins::queue::{JobStatus, claim_batch, enqueue, get_job, mark_failed};
use coldchain::plugins::worker::{Compressor, run_batch};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn open_store(root: &Path, config: Config) -> Store {
    Store::open_with(root, config, Arc::new(ManualClock::at(2025, 1, 15))).unwrap()
}

/// Reverses the payload; refuses payloads containing "poison".
struct Reverse;

impl Compressor for Reverse {
    fn codec(&self) -> &str {
        "reverse"
    }

    fn compress(&self, _mime_type: &str, payload: &[u8]) -> Result<Vec<u8>, String> {
        if payload.windows(6).any(|w| w == b"poison") {
            return Err("codec rejected payload".to_string());
        }
        Ok(payload.iter().rev().copied().collect())
    }
}

#[test]
fn test_batch_compresses_and_completes_jobs() {
    let tmp = tempdir().unwrap();
    let store = open_store(tmp.path(), Config::default());
    let mut jobs = Vec::new();
    for msg in ["abc", "hello"] {
        let raw = intake(&store, "room-a", msg.as_bytes(), "text/plain").unwrap();
        jobs.push(enqueue(&store, &raw).unwrap());
    }

    let report = run_batch(&store, &Reverse, 10).unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.done.len(), 2);
    assert!(report.is_clean());

    for done in &report.done {
        assert_eq!(get_job(&store, &done.job_id).unwrap().status, JobStatus::Done);
        assert_eq!(get_compressed(&store, &done.compressed_id).unwrap().codec, "reverse");
    }
    assert_eq!(fetch_compressed(&store, &report.done[0].compressed_id).unwrap(), b"cba");

    let empty = run_batch(&store, &Reverse, 10).unwrap();
    assert_eq!(empty.claimed, 0);
}

#[test]
fn test_codec_failures_are_reported_not_thrown() {
    let tmp = tempdir().unwrap();
    let mut config = Config::default();
    config.queue.max_attempts = 2;
    let store = open_store(tmp.path(), config);
    let raw = intake(&store, "room-a", b"poison pill", "text/plain").unwrap();
    let job_id = enqueue(&store, &raw).unwrap();

    let first = run_batch(&store, &Reverse, 10).unwrap();
    assert!(first.done.is_empty());
    assert_eq!(first.requeued.len(), 1);
    assert!(matches!(
        &first.requeued[0],
        ColdchainError::RetryableProcessing { attempts: 1, max_attempts: 2, .. }
    ));
    assert_eq!(get_job(&store, &job_id).unwrap().status, JobStatus::Pending);

    let second = run_batch(&store, &Reverse, 10).unwrap();
    assert_eq!(second.failed.len(), 1);
    assert!(matches!(
        &second.failed[0],
        ColdchainError::TerminalProcessing { attempts: 2, .. }
    ));
    let job = get_job(&store, &job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("codec rejected payload"));
}

#[test]
fn test_batch_recovers_job_whose_record_was_already_committed() {
    let tmp = tempdir().unwrap();
    let store = open_store(tmp.path(), Config::default());
    let raw = intake(&store, "room-a", b"hello", "text/plain").unwrap();
    let job_id = enqueue(&store, &raw).unwrap();

    // A previous worker committed the record, then failed before mark_done.
    let lease = claim_batch(&store, 1).unwrap().remove(0).lease_id;
    let compressed_id = encode_raw_to_compressed(&store, &raw, "reverse", b"olleh").unwrap();
    mark_failed(&store, &job_id, &lease, "worker lost connection").unwrap();

    let report = run_batch(&store, &Reverse, 10).unwrap();
    assert_eq!(report.done.len(), 1);
    assert_eq!(report.done[0].compressed_id, compressed_id);
    let job = get_job(&store, &job_id).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.compressed_id.as_deref(), Some(compressed_id.as_str()));
}
