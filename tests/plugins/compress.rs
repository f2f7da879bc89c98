use coldchain::core::config::Config;
use coldchain::core::error::ColdchainError;
use coldchain::core::store::Store;
use coldchain::core::time::{ManualClock, SECS_PER_DAY};
use coldchain::plugins::compress::{
    LifecycleState, compressed_id_for_raw, dispose, encode_raw_to_compressed, fetch_compressed,
    get_compressed,
};
use coldchain::plugins::holds::{apply_hold, release_hold};
use coldchain::plugins::intake::{intake, load_raw};
use coldchain::plugins::partitions::{create_partition_if_needed, list_partitions};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

fn open_store(root: &Path, config: Config) -> (Store, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at(2025, 1, 15));
    let store = Store::open_with(root, config, clock.clone()).unwrap();
    (store, clock)
}

#[test]
fn test_intake_checksum_is_sha256_of_payload() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());

    for (payload, expected) in [(&b"hello"[..], HELLO_SHA256), (&b""[..], EMPTY_SHA256)] {
        let raw_id = intake(&store, "room-a", payload, "text/plain").unwrap();
        let raw = load_raw(&store, &raw_id).unwrap();
        assert_eq!(raw.checksum, expected);
        assert_eq!(raw.length, payload.len() as i64);
        assert_eq!(raw.payload, payload);
        assert!(!raw.processed);
    }
}

#[test]
fn test_intake_rejects_blank_room_and_mime() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    assert!(matches!(
        intake(&store, " ", b"x", "text/plain"),
        Err(ColdchainError::Validation(_))
    ));
    assert!(matches!(
        intake(&store, "room-a", b"x", ""),
        Err(ColdchainError::Validation(_))
    ));
}

#[test]
fn test_second_encode_is_conflict() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    let raw_id = intake(&store, "room-a", b"hello", "text/plain").unwrap();

    let first = encode_raw_to_compressed(&store, &raw_id, "lz4", b"packed").unwrap();
    let err = encode_raw_to_compressed(&store, &raw_id, "lz4", b"packed").unwrap_err();
    assert!(matches!(err, ColdchainError::Conflict(_)));

    assert!(load_raw(&store, &raw_id).unwrap().processed);
    assert_eq!(compressed_id_for_raw(&store, &raw_id).unwrap(), Some(first));
}

#[test]
fn test_encode_missing_raw_is_not_found() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    let err = encode_raw_to_compressed(&store, "missing", "lz4", b"x").unwrap_err();
    assert!(matches!(err, ColdchainError::NotFound(_)));
    let err = encode_raw_to_compressed(&store, "missing", "", b"x").unwrap_err();
    assert!(matches!(err, ColdchainError::Validation(_)));
}

#[test]
fn test_record_lands_in_month_partition() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    let raw_id = intake(&store, "room-a", b"hello", "text/plain").unwrap();
    let created_at = load_raw(&store, &raw_id).unwrap().created_at;

    let compressed_id = encode_raw_to_compressed(&store, &raw_id, "zstd", b"zz").unwrap();
    let record = get_compressed(&store, &compressed_id).unwrap();
    assert_eq!(record.partition_key, "2025_01");
    assert_eq!(record.table_name, "logs_compressed_2025_01");
    assert_eq!(record.created_at, created_at);
    assert_eq!(record.room_id, "room-a");
    assert_eq!(record.codec, "zstd");
    assert_eq!(record.original_length, 5);
    assert_eq!(record.compressed_length, 2);
    assert_eq!(record.lifecycle_state, LifecycleState::Hot);
    assert!(record.cold_storage_uri.is_none());
}

#[test]
fn test_overflow_partition_catches_records_without_partition() {
    let tmp = tempdir().unwrap();
    let mut config = Config::default();
    config.partitions.auto_create = false;
    let (store, _clock) = open_store(tmp.path(), config);
    let raw_id = intake(&store, "room-a", b"hello", "text/plain").unwrap();

    let compressed_id = encode_raw_to_compressed(&store, &raw_id, "lz4", b"bytes").unwrap();
    let record = get_compressed(&store, &compressed_id).unwrap();
    assert_eq!(record.table_name, "logs_compressed_default");
    assert_eq!(record.partition_key, "2025_01");

    // Creating the month partition later moves the record across.
    create_partition_if_needed(&store, "2025_01").unwrap();
    let record = get_compressed(&store, &compressed_id).unwrap();
    assert_eq!(record.table_name, "logs_compressed_2025_01");
    assert_eq!(fetch_compressed(&store, &compressed_id).unwrap(), b"bytes");

    let partitions = list_partitions(&store).unwrap();
    let default = partitions
        .iter()
        .find(|p| p.partition_key == "default")
        .unwrap();
    assert_eq!(default.rows, 0);
}

#[test]
fn test_fetch_returns_bytes_and_detects_tampering() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    let raw_id = intake(&store, "room-a", b"hello", "text/plain").unwrap();
    let payload = vec![0u8, 1, 2, 250, 251, 252];
    let compressed_id = encode_raw_to_compressed(&store, &raw_id, "lz4", &payload).unwrap();

    assert_eq!(fetch_compressed(&store, &compressed_id).unwrap(), payload);

    let conn = Connection::open(store.broker().db_path()).unwrap();
    conn.execute(
        "UPDATE logs_compressed_2025_01 SET compressed_bytes = X'00' WHERE id = ?1",
        [&compressed_id],
    )
    .unwrap();

    let err = fetch_compressed(&store, &compressed_id).unwrap_err();
    assert!(matches!(err, ColdchainError::Integrity { .. }));

    let err = fetch_compressed(&store, "missing").unwrap_err();
    assert!(matches!(err, ColdchainError::NotFound(_)));
}

#[test]
fn test_dispose_purge_is_monotonic() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    let raw_id = intake(&store, "room-a", b"hello", "text/plain").unwrap();
    let compressed_id = encode_raw_to_compressed(&store, &raw_id, "lz4", b"packed").unwrap();

    let outcome = dispose(&store, &compressed_id, true).unwrap();
    assert!(outcome.changed);
    assert!(outcome.purged);
    assert_eq!(outcome.lifecycle_state, LifecycleState::Deleted);

    let record = get_compressed(&store, &compressed_id).unwrap();
    assert_eq!(record.lifecycle_state, LifecycleState::Deleted);
    assert_eq!(record.compressed_length, 0);
    assert!(record.purged);

    let err = fetch_compressed(&store, &compressed_id).unwrap_err();
    assert!(matches!(err, ColdchainError::NotFound(_)));

    let again = dispose(&store, &compressed_id, true).unwrap();
    assert!(!again.changed);
    let soft = dispose(&store, &compressed_id, false).unwrap();
    assert!(!soft.changed);
    assert!(soft.purged);
}

#[test]
fn test_soft_dispose_keeps_bytes_until_purged() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    let raw_id = intake(&store, "room-a", b"hello", "text/plain").unwrap();
    let compressed_id = encode_raw_to_compressed(&store, &raw_id, "lz4", b"packed").unwrap();

    let outcome = dispose(&store, &compressed_id, false).unwrap();
    assert!(outcome.changed);
    assert!(!outcome.purged);
    let record = get_compressed(&store, &compressed_id).unwrap();
    assert_eq!(record.lifecycle_state, LifecycleState::Deleted);
    assert_eq!(record.compressed_length, 6);

    let outcome = dispose(&store, &compressed_id, true).unwrap();
    assert!(outcome.changed);
    assert!(outcome.purged);
    assert_eq!(get_compressed(&store, &compressed_id).unwrap().compressed_length, 0);
}

#[test]
fn test_dispose_refused_under_hold() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path(), Config::default());
    let raw_id = intake(&store, "room-a", b"hello", "text/plain").unwrap();
    let compressed_id = encode_raw_to_compressed(&store, &raw_id, "lz4", b"packed").unwrap();

    let until = store.now() + 30 * SECS_PER_DAY;
    apply_hold(&store, "room", "room-a", until, "litigation", "legal@corp").unwrap();
    let err = dispose(&store, &compressed_id, true).unwrap_err();
    assert!(matches!(err, ColdchainError::Conflict(_)));
    assert_eq!(fetch_compressed(&store, &compressed_id).unwrap(), b"packed");

    release_hold(&store, "room", "room-a").unwrap();
    assert!(dispose(&store, &compressed_id, true).unwrap().changed);
}
