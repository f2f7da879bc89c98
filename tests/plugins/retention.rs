use coldchain::core::config::Config;
use coldchain::core::error::ColdchainError;
use coldchain::core::store::Store;
use coldchain::core::time::ManualClock;
use coldchain::plugins::compress::{LifecycleState, encode_raw_to_compressed, get_compressed};
use coldchain::plugins::intake::intake;
use coldchain::plugins::retention::{
    EntryStatus, RetentionAction, due_entries, effective_retention, entries_for,
    get_room_retention, mark_cold_storage, mark_entry_failed, retry_entry, schedule_retention,
    set_room_retention,
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

fn compressed_in(store: &Store, room: &str) -> String {
    let raw = intake(store, room, b"payload", "text/plain").unwrap();
    encode_raw_to_compressed(store, &raw, "lz4", b"packed").unwrap()
}

#[test]
fn test_hot_records_scheduled_after_default_window() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");

    clock.advance_days(29);
    let run = schedule_retention(&store).unwrap();
    assert_eq!((run.hot_scheduled, run.cold_scheduled), (0, 0));

    // Exactly at the window is not yet past it.
    clock.advance_days(1);
    let run = schedule_retention(&store).unwrap();
    assert_eq!((run.hot_scheduled, run.cold_scheduled), (0, 0));

    clock.advance_secs(1);
    let run = schedule_retention(&store).unwrap();
    assert_eq!((run.hot_scheduled, run.cold_scheduled), (1, 0));
    assert_eq!(run.timestamp, format!("{}Z", store.now()));

    let entries = entries_for(&store, "logs_compressed", &id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, RetentionAction::MoveToCold);
    assert_eq!(entries[0].status, EntryStatus::Pending);
    assert_eq!(entries[0].room_id.as_deref(), Some("room-a"));

    // Re-running never duplicates an active entry.
    let run = schedule_retention(&store).unwrap();
    assert_eq!(run.hot_scheduled, 0);
    assert_eq!(entries_for(&store, "logs_compressed", &id).unwrap().len(), 1);
}

#[test]
fn test_room_override_takes_precedence() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    set_room_retention(&store, "room-short", Some(7), None).unwrap();
    set_room_retention(&store, "room-long", Some(60), None).unwrap();
    let short = compressed_in(&store, "room-short");
    let long = compressed_in(&store, "room-long");
    let plain = compressed_in(&store, "room-plain");

    clock.advance_days(7);
    clock.advance_secs(1);
    let run = schedule_retention(&store).unwrap();
    assert_eq!(run.hot_scheduled, 1);
    assert_eq!(entries_for(&store, "logs_compressed", &short).unwrap().len(), 1);
    assert!(entries_for(&store, "logs_compressed", &plain).unwrap().is_empty());

    clock.advance_days(23);
    let run = schedule_retention(&store).unwrap();
    assert_eq!(run.hot_scheduled, 1);
    assert_eq!(entries_for(&store, "logs_compressed", &plain).unwrap().len(), 1);
    assert!(entries_for(&store, "logs_compressed", &long).unwrap().is_empty());

    clock.advance_days(30);
    assert_eq!(schedule_retention(&store).unwrap().hot_scheduled, 1);
    assert_eq!(entries_for(&store, "logs_compressed", &long).unwrap().len(), 1);
}

#[test]
fn test_room_retention_round_trip() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    assert!(get_room_retention(&store, "room-a").unwrap().is_none());

    set_room_retention(&store, "room-a", Some(7), Some(90)).unwrap();
    let row = get_room_retention(&store, "room-a").unwrap().unwrap();
    assert_eq!(row.retention_hot_days, Some(7));
    assert_eq!(row.retention_cold_days, Some(90));

    set_room_retention(&store, "room-a", None, Some(90)).unwrap();
    let effective = effective_retention(&store, "room-a").unwrap();
    assert_eq!(effective.hot_days, 30);
    assert!(!effective.hot_overridden);
    assert_eq!(effective.cold_days, 90);
    assert!(effective.cold_overridden);

    let err = set_room_retention(&store, "room-a", Some(0), None).unwrap_err();
    assert!(matches!(err, ColdchainError::Validation(_)));
}

#[test]
fn test_cold_move_then_delete_scheduling() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    set_room_retention(&store, "room-a", Some(7), Some(30)).unwrap();
    let id = compressed_in(&store, "room-a");

    clock.advance_days(7);
    clock.advance_secs(1);
    schedule_retention(&store).unwrap();
    let due = due_entries(&store, 10).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].resource_id, id);

    assert!(mark_cold_storage(&store, &id, "s3://cold/bucket/obj-1").unwrap());
    assert!(!mark_cold_storage(&store, &id, "s3://cold/bucket/other").unwrap());

    let record = get_compressed(&store, &id).unwrap();
    assert_eq!(record.lifecycle_state, LifecycleState::Cold);
    assert_eq!(record.cold_storage_uri.as_deref(), Some("s3://cold/bucket/obj-1"));
    assert!(due_entries(&store, 10).unwrap().is_empty());
    let entries = entries_for(&store, "logs_compressed", &id).unwrap();
    assert_eq!(entries[0].status, EntryStatus::Done);

    // Cold window is measured from creation: 30 days total.
    clock.advance_days(22);
    assert_eq!(schedule_retention(&store).unwrap().cold_scheduled, 0);
    clock.advance_days(1);
    let run = schedule_retention(&store).unwrap();
    assert_eq!((run.hot_scheduled, run.cold_scheduled), (0, 1));

    let due = due_entries(&store, 10).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].action, RetentionAction::Delete);
}

#[test]
fn test_mark_cold_storage_validation() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");
    assert!(matches!(
        mark_cold_storage(&store, &id, " "),
        Err(ColdchainError::Validation(_))
    ));
    assert!(matches!(
        mark_cold_storage(&store, "missing", "s3://x"),
        Err(ColdchainError::NotFound(_))
    ));
}

#[test]
fn test_failed_entry_is_recorded_and_stays_active() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");
    clock.advance_days(31);
    schedule_retention(&store).unwrap();

    let entry = due_entries(&store, 1).unwrap().remove(0);
    mark_entry_failed(&store, &entry.id, "object store unavailable").unwrap();
    let entries = entries_for(&store, "logs_compressed", &id).unwrap();
    assert_eq!(entries[0].status, EntryStatus::Failed);
    assert_eq!(entries[0].last_error.as_deref(), Some("object store unavailable"));

    let err = mark_entry_failed(&store, &entry.id, "again").unwrap_err();
    assert!(matches!(err, ColdchainError::Conflict(_)));
    let err = mark_entry_failed(&store, "missing", "x").unwrap_err();
    assert!(matches!(err, ColdchainError::NotFound(_)));

    // An unresolved failure still counts as scheduled.
    assert_eq!(schedule_retention(&store).unwrap().hot_scheduled, 0);
    assert!(due_entries(&store, 10).unwrap().is_empty());
}

#[test]
fn test_failed_entry_can_be_retried() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");
    clock.advance_days(31);
    schedule_retention(&store).unwrap();
    let entry = due_entries(&store, 1).unwrap().remove(0);

    let err = retry_entry(&store, &entry.id).unwrap_err();
    assert!(matches!(err, ColdchainError::Conflict(_)));

    mark_entry_failed(&store, &entry.id, "object store unavailable").unwrap();
    clock.advance_days(3650);
    assert!(due_entries(&store, 10).unwrap().is_empty());
    assert_eq!(
        get_compressed(&store, &id).unwrap().lifecycle_state,
        LifecycleState::Hot
    );

    retry_entry(&store, &entry.id).unwrap();
    let due = due_entries(&store, 10).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, entry.id);
    assert_eq!(due[0].status, EntryStatus::Pending);

    assert!(mark_cold_storage(&store, &id, "s3://cold/bucket/obj-1").unwrap());
    let entries = entries_for(&store, "logs_compressed", &id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Done);
    assert_eq!(
        get_compressed(&store, &id).unwrap().lifecycle_state,
        LifecycleState::Cold
    );

    let err = retry_entry(&store, &entry.id).unwrap_err();
    assert!(matches!(err, ColdchainError::Conflict(_)));
    let err = retry_entry(&store, "missing").unwrap_err();
    assert!(matches!(err, ColdchainError::NotFound(_)));
}

#[test]
fn test_concurrent_sweeps_never_duplicate_entries() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let (store, clock) = open_store(&root);
    for i in 0..10 {
        compressed_in(&store, &format!("room-{i}"));
    }
    clock.advance_days(31);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let sweeper = Store::open_with(&root, Config::default(), clock.clone()).unwrap();
            thread::spawn(move || schedule_retention(&sweeper).unwrap().hot_scheduled)
        })
        .collect();
    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 10);

    let conn = Connection::open(store.broker().db_path()).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM retention_schedule", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 10);
}
