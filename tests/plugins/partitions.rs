use coldchain::core::config::Config;
use coldchain::core::error::ColdchainError;
use coldchain::core::store::Store;
use coldchain::core::time::{ManualClock, SECS_PER_DAY};
use coldchain::plugins::audit::list_events;
use coldchain::plugins::compress::{encode_raw_to_compressed, get_compressed};
use coldchain::plugins::holds::apply_hold;
use coldchain::plugins::intake::intake;
use coldchain::plugins::partitions::{
    PartitionKey, create_partition_if_needed, drop_partition, list_partitions,
};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn open_store(root: &Path) -> (Store, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at(2025, 1, 15));
    let store = Store::open_with(root, Config::default(), clock.clone()).unwrap();
    (store, clock)
}

fn count_schema_objects(store: &Store, kind: &str, name: &str) -> i64 {
    let conn = Connection::open(store.broker().db_path()).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
        [kind, name],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn test_create_partition_is_idempotent() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());

    let first = create_partition_if_needed(&store, "2025_01").unwrap();
    let second = create_partition_if_needed(&store, "2025_01").unwrap();
    assert_eq!(first, "logs_compressed_2025_01");
    assert_eq!(first, second);

    assert_eq!(count_schema_objects(&store, "table", "logs_compressed_2025_01"), 1);
    assert_eq!(
        count_schema_objects(&store, "index", "idx_logs_compressed_2025_01_lifecycle"),
        1
    );

    let partitions = list_partitions(&store).unwrap();
    let keys: Vec<_> = partitions.iter().map(|p| p.partition_key.as_str()).collect();
    assert_eq!(keys, vec!["2025_01", "default"]);
    let jan = &partitions[0];
    let (start, end) = PartitionKey::parse("2025_01").unwrap().bounds().unwrap();
    assert_eq!(jan.range_start, Some(start));
    assert_eq!(jan.range_end, Some(end));
    assert_eq!(end - start, 31 * SECS_PER_DAY);

    let created: Vec<_> = list_events(&store, store.node_id(), 100)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "partition.created")
        .collect();
    assert_eq!(created.len(), 1);
}

#[test]
fn test_concurrent_create_partition_converges() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let store = Arc::new(store);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || create_partition_if_needed(&store, "2025_02").unwrap())
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), "logs_compressed_2025_02");
    }
    let partitions = list_partitions(&store).unwrap();
    assert_eq!(
        partitions
            .iter()
            .filter(|p| p.partition_key == "2025_02")
            .count(),
        1
    );
}

#[test]
fn test_malformed_keys_are_rejected() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    for bad in ["2025-01", "2025_13", "jan", "2025_01; DROP TABLE raw_records"] {
        let err = create_partition_if_needed(&store, bad).unwrap_err();
        assert!(matches!(err, ColdchainError::Validation(_)), "{bad}");
    }
}

#[test]
fn test_default_partition_cannot_be_dropped() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let err = drop_partition(&store, "default").unwrap_err();
    assert!(matches!(err, ColdchainError::Validation(_)));
    let err = drop_partition(&store, "2030_01").unwrap_err();
    assert!(matches!(err, ColdchainError::NotFound(_)));
}

#[test]
fn test_drop_partition_removes_rows() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let mut ids = Vec::new();
    for i in 0..3 {
        let raw = intake(&store, "room-a", format!("m{i}").as_bytes(), "text/plain").unwrap();
        ids.push(encode_raw_to_compressed(&store, &raw, "lz4", b"abc").unwrap());
    }

    let jan = list_partitions(&store)
        .unwrap()
        .into_iter()
        .find(|p| p.partition_key == "2025_01")
        .unwrap();
    assert_eq!(jan.rows, 3);
    assert_eq!(jan.bytes, 9);

    assert_eq!(drop_partition(&store, "2025_01").unwrap(), 3);
    assert_eq!(count_schema_objects(&store, "table", "logs_compressed_2025_01"), 0);
    for id in &ids {
        assert!(matches!(
            get_compressed(&store, id),
            Err(ColdchainError::NotFound(_))
        ));
    }
    let keys: Vec<_> = list_partitions(&store)
        .unwrap()
        .into_iter()
        .map(|p| p.partition_key)
        .collect();
    assert_eq!(keys, vec!["default".to_string()]);
}

#[test]
fn test_drop_partition_refused_while_record_held() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let raw = intake(&store, "room-a", b"m", "text/plain").unwrap();
    let compressed_id = encode_raw_to_compressed(&store, &raw, "lz4", b"abc").unwrap();

    let until = store.now() + SECS_PER_DAY;
    apply_hold(&store, "logs_compressed", &compressed_id, until, "audit", "ops").unwrap();

    let err = drop_partition(&store, "2025_01").unwrap_err();
    assert!(matches!(err, ColdchainError::Conflict(_)));
    assert!(get_compressed(&store, &compressed_id).is_ok());
}
