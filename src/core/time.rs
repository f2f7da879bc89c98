//! Clocks, month arithmetic and the command envelope shared by CLI surfaces.
//!
//! Every persisted timestamp is unix-epoch seconds. Store operations read the
//! current time through a [`Clock`] so retention windows and retry backoff can
//! be driven deterministically in tests.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicI64, Ordering};
use ulid::Ulid;

pub const SECS_PER_DAY: i64 = 86_400;

/// Source of "now" for store operations.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Settable clock for tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    pub fn new(secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(secs),
        }
    }

    pub fn at(year: i32, month: u32, day: u32) -> Self {
        let secs = Utc
            .with_ymd_and_hms(year, month, day, 12, 0, 0)
            .single()
            .map(|dt| dt.timestamp())
            .unwrap_or_default();
        Self::new(secs)
    }

    pub fn advance_days(&self, days: i64) {
        self.secs.fetch_add(days * SECS_PER_DAY, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }
}

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn epoch_z(secs: i64) -> String {
    format!("{}Z", secs)
}

pub fn now_epoch_z() -> String {
    epoch_z(SystemClock.now_secs())
}

pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// `YYYY_MM` for the UTC month containing `secs`.
pub fn partition_key_for(secs: i64) -> String {
    let dt: DateTime<Utc> = DateTime::from_timestamp(secs, 0).unwrap_or_default();
    format!("{:04}_{:02}", dt.year(), dt.month())
}

/// Half-open `[month_start, next_month_start)` bounds in epoch seconds.
pub fn month_bounds(year: i32, month: u32) -> Option<(i64, i64)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let (ny, nm) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = NaiveDate::from_ymd_opt(ny, nm, 1)?;
    Some((
        start.and_hms_opt(0, 0, 0)?.and_utc().timestamp(),
        end.and_hms_opt(0, 0, 0)?.and_utc().timestamp(),
    ))
}

/// Standard command response envelope shape used across CLI surfaces.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
