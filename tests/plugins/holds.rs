use coldchain::core::config::Config;
use coldchain::core::error::ColdchainError;
use coldchain::core::store::Store;
use coldchain::core::time::{ManualClock, SECS_PER_DAY};
use coldchain::plugins::audit::list_events;
use coldchain::plugins::compress::encode_raw_to_compressed;
use coldchain::plugins::holds::{
    apply_hold, get_hold, hold_until_after_days, list_holds, release_hold,
};
use coldchain::plugins::intake::intake;
use coldchain::plugins::retention::{EntryStatus, due_entries, entries_for, schedule_retention};
use std::path::Path;
use std::sync::Arc;
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

fn days_from_now(store: &Store, days: i64) -> i64 {
    store.now() + days * SECS_PER_DAY
}

#[test]
fn test_held_record_is_never_scheduled() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let held = compressed_in(&store, "room-a");
    let free = compressed_in(&store, "room-a");

    let until = days_from_now(&store, 400);
    apply_hold(&store, "logs_compressed", &held, until, "subpoena", "legal").unwrap();

    clock.advance_days(31);
    let run = schedule_retention(&store).unwrap();
    assert_eq!(run.hot_scheduled, 1);
    assert!(entries_for(&store, "logs_compressed", &held).unwrap().is_empty());
    assert_eq!(entries_for(&store, "logs_compressed", &free).unwrap().len(), 1);

    clock.advance_days(300);
    schedule_retention(&store).unwrap();
    assert!(entries_for(&store, "logs_compressed", &held).unwrap().is_empty());
}

#[test]
fn test_room_hold_covers_every_record_in_room() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let a1 = compressed_in(&store, "room-a");
    let a2 = compressed_in(&store, "room-a");
    let b1 = compressed_in(&store, "room-b");

    let until = days_from_now(&store, 90);
    apply_hold(&store, "room", "room-a", until, "investigation", "legal").unwrap();

    clock.advance_days(31);
    let run = schedule_retention(&store).unwrap();
    assert_eq!(run.hot_scheduled, 1);
    assert!(entries_for(&store, "logs_compressed", &a1).unwrap().is_empty());
    assert!(entries_for(&store, "logs_compressed", &a2).unwrap().is_empty());
    assert_eq!(entries_for(&store, "logs_compressed", &b1).unwrap().len(), 1);
}

#[test]
fn test_hold_pauses_and_release_resumes_entries() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");
    clock.advance_days(31);
    schedule_retention(&store).unwrap();
    assert_eq!(due_entries(&store, 10).unwrap().len(), 1);

    let until = days_from_now(&store, 10);
    apply_hold(&store, "logs_compressed", &id, until, "review", "legal").unwrap();
    let entry = entries_for(&store, "logs_compressed", &id).unwrap().remove(0);
    assert_eq!(entry.status, EntryStatus::OnHold);
    assert!(entry.on_hold);
    assert_eq!(entry.hold_reason.as_deref(), Some("review"));
    assert!(due_entries(&store, 10).unwrap().is_empty());

    assert_eq!(release_hold(&store, "logs_compressed", &id).unwrap(), 1);
    let entry = entries_for(&store, "logs_compressed", &id).unwrap().remove(0);
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(!entry.on_hold);
    assert!(entry.hold_reason.is_none());
    assert_eq!(due_entries(&store, 10).unwrap().len(), 1);
}

#[test]
fn test_release_keeps_entry_paused_under_overlapping_room_hold() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");
    clock.advance_days(31);
    schedule_retention(&store).unwrap();

    let until = days_from_now(&store, 10);
    apply_hold(&store, "logs_compressed", &id, until, "review", "legal").unwrap();
    apply_hold(&store, "room", "room-a", until, "room review", "legal").unwrap();

    assert_eq!(release_hold(&store, "logs_compressed", &id).unwrap(), 0);
    let entry = entries_for(&store, "logs_compressed", &id).unwrap().remove(0);
    assert_eq!(entry.status, EntryStatus::OnHold);

    assert_eq!(release_hold(&store, "room", "room-a").unwrap(), 1);
    let entry = entries_for(&store, "logs_compressed", &id).unwrap().remove(0);
    assert_eq!(entry.status, EntryStatus::Pending);
}

#[test]
fn test_expired_hold_stops_excluding() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");
    let until = days_from_now(&store, 40);
    apply_hold(&store, "logs_compressed", &id, until, "short review", "legal").unwrap();

    clock.advance_days(35);
    assert_eq!(schedule_retention(&store).unwrap().hot_scheduled, 0);

    clock.advance_days(5);
    assert_eq!(schedule_retention(&store).unwrap().hot_scheduled, 1);
    assert!(list_holds(&store, true).unwrap().is_empty());
    assert_eq!(list_holds(&store, false).unwrap().len(), 1);
}

#[test]
fn test_expired_hold_resumes_paused_entries_on_next_sweep() {
    let tmp = tempdir().unwrap();
    let (store, clock) = open_store(tmp.path());
    let id = compressed_in(&store, "room-a");
    clock.advance_days(31);
    schedule_retention(&store).unwrap();

    let until = days_from_now(&store, 2);
    apply_hold(&store, "room", "room-a", until, "brief", "legal").unwrap();
    assert!(due_entries(&store, 10).unwrap().is_empty());

    clock.advance_days(3);
    let run = schedule_retention(&store).unwrap();
    assert_eq!(run.resumed, 1);
    let due = due_entries(&store, 10).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].resource_id, id);
}

#[test]
fn test_reapplying_hold_keeps_latest_expiry() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let long = days_from_now(&store, 10);
    let short = days_from_now(&store, 5);

    let first = apply_hold(&store, "room", "room-a", long, "first", "alice").unwrap();
    let second = apply_hold(&store, "room", "room-a", short, "second", "bob").unwrap();
    assert_eq!(first, second);

    let hold = get_hold(&store, "room", "room-a").unwrap().unwrap();
    assert_eq!(hold.hold_until, long);
    assert_eq!(hold.reason, "second");
    assert_eq!(hold.actor, "bob");
    assert_eq!(list_holds(&store, true).unwrap().len(), 1);
}

#[test]
fn test_hold_validation() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let future = days_from_now(&store, 1);

    let err = apply_hold(&store, "message", "m1", future, "r", "a").unwrap_err();
    assert!(matches!(err, ColdchainError::Validation(_)));
    let err = apply_hold(&store, "room", "room-a", store.now(), "r", "a").unwrap_err();
    assert!(matches!(err, ColdchainError::Validation(_)));
    let err = apply_hold(&store, "room", "", future, "r", "a").unwrap_err();
    assert!(matches!(err, ColdchainError::Validation(_)));
    let err = release_hold(&store, "room", "never-held").unwrap_err();
    assert!(matches!(err, ColdchainError::NotFound(_)));
}

#[test]
fn test_hold_duration_in_days_is_range_checked() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let now = store.now();

    assert_eq!(hold_until_after_days(now, 90).unwrap(), now + 90 * SECS_PER_DAY);
    for days in [i64::MAX, i64::MAX / SECS_PER_DAY, i64::MIN] {
        let err = hold_until_after_days(now, days).unwrap_err();
        assert!(matches!(err, ColdchainError::Validation(_)), "days = {days}");
    }

    // A negative duration computes fine but is refused as a past expiry.
    let past = hold_until_after_days(now, -1).unwrap();
    let err = apply_hold(&store, "room", "room-a", past, "r", "a").unwrap_err();
    assert!(matches!(err, ColdchainError::Validation(_)));
}

#[test]
fn test_hold_changes_are_audited() {
    let tmp = tempdir().unwrap();
    let (store, _clock) = open_store(tmp.path());
    let until = days_from_now(&store, 1);
    apply_hold(&store, "room", "room-a", until, "r", "legal").unwrap();
    release_hold(&store, "room", "room-a").unwrap();

    let types: Vec<_> = list_events(&store, store.node_id(), 10)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["hold.applied", "hold.released"]);
}
