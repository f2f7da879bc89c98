//! Retention scheduler.
//!
//! A sweep walks every partition and schedules `move_to_cold` for hot records
//! older than their effective hot window and `delete` for cold records older
//! than their effective cold window. Both windows are measured from the
//! record's `created_at`. A per-room override replaces the system default for
//! that room. Records already scheduled, or under an active legal hold, are
//! skipped. Inserts go through the partial unique index on active entries, so
//! an overlapping sweep cannot create a duplicate.

use crate::core::error::ColdchainError;
use crate::core::schemas::COMPRESSED_RESOURCE;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::audit::{self, AppendRequest, LifecycleEvent};
use crate::plugins::compress;
use crate::plugins::holds;
use crate::plugins::partitions;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, named_params, params};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionAction {
    MoveToCold,
    Delete,
}

impl RetentionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RetentionAction::MoveToCold => "move_to_cold",
            RetentionAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ColdchainError> {
        match s {
            "move_to_cold" => Ok(RetentionAction::MoveToCold),
            "delete" => Ok(RetentionAction::Delete),
            other => Err(ColdchainError::Validation(format!(
                "unknown retention action '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Done,
    Failed,
    OnHold,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Done => "done",
            EntryStatus::Failed => "failed",
            EntryStatus::OnHold => "on_hold",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ColdchainError> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "done" => Ok(EntryStatus::Done),
            "failed" => Ok(EntryStatus::Failed),
            "on_hold" => Ok(EntryStatus::OnHold),
            other => Err(ColdchainError::Validation(format!(
                "unknown schedule status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub room_id: Option<String>,
    pub scheduled_for: i64,
    pub action: RetentionAction,
    pub status: EntryStatus,
    pub on_hold: bool,
    pub hold_reason: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RetentionRun {
    pub hot_scheduled: u64,
    pub cold_scheduled: u64,
    /// Entries returned to `pending` because the hold parking them expired.
    pub resumed: u64,
    pub timestamp: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RoomRetention {
    pub room_id: String,
    pub retention_hot_days: Option<i64>,
    pub retention_cold_days: Option<i64>,
    pub updated_at: i64,
}

/// Windows that apply to a room after overrides.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveRetention {
    pub hot_days: i64,
    pub cold_days: i64,
    pub hot_overridden: bool,
    pub cold_overridden: bool,
}

const ENTRY_COLUMNS: &str = "id, resource_type, resource_id, room_id, scheduled_for, action, status, \
     on_hold, hold_reason, last_error, created_at, updated_at";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ScheduleEntry, String, String)> {
    Ok((
        ScheduleEntry {
            id: row.get(0)?,
            resource_type: row.get(1)?,
            resource_id: row.get(2)?,
            room_id: row.get(3)?,
            scheduled_for: row.get(4)?,
            action: RetentionAction::MoveToCold,
            status: EntryStatus::Pending,
            on_hold: row.get(7)?,
            hold_reason: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        },
        row.get(5)?,
        row.get(6)?,
    ))
}

fn collect_entries(
    rows: impl Iterator<Item = rusqlite::Result<(ScheduleEntry, String, String)>>,
) -> Result<Vec<ScheduleEntry>, ColdchainError> {
    let mut out = Vec::new();
    for r in rows {
        let (mut entry, action, status) = r?;
        entry.action = RetentionAction::parse(&action)?;
        entry.status = EntryStatus::parse(&status)?;
        out.push(entry);
    }
    Ok(out)
}

/// Candidates in one partition table for `action`: strictly past their window, not
/// already scheduled, not held.
fn due_records(
    conn: &Connection,
    table: &str,
    action: RetentionAction,
    default_days: i64,
    now: i64,
) -> Result<Vec<(String, String)>, ColdchainError> {
    let (state, override_column) = match action {
        RetentionAction::MoveToCold => ("hot", "retention_hot_days"),
        RetentionAction::Delete => ("cold", "retention_cold_days"),
    };
    let sql = format!(
        "SELECT c.id, c.room_id FROM {table} c
         LEFT JOIN room_retention r ON r.room_id = c.room_id
         WHERE c.lifecycle_state = :state
           AND c.created_at + COALESCE(r.{override_column}, :default_days) * :day < :now
           AND NOT EXISTS (SELECT 1 FROM retention_schedule s
                           WHERE s.resource_type = :resource AND s.resource_id = c.id
                             AND s.action = :action AND s.status != 'done')
           AND NOT {hold}
         ORDER BY c.created_at ASC, c.id ASC",
        hold = holds::ACTIVE_HOLD_PREDICATE
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        named_params! {
            ":state": state,
            ":default_days": default_days,
            ":day": time::SECS_PER_DAY,
            ":now": now,
            ":resource": COMPRESSED_RESOURCE,
            ":action": action.as_str(),
        },
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn insert_entries(
    conn: &Connection,
    candidates: &[(String, String)],
    action: RetentionAction,
    now: i64,
) -> Result<u64, ColdchainError> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO retention_schedule(id, resource_type, resource_id, room_id, scheduled_for,
                                                  action, status, on_hold, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?5, ?5)",
    )?;
    let mut inserted = 0u64;
    for (compressed_id, room_id) in candidates {
        inserted += stmt.execute(params![
            time::new_id(),
            COMPRESSED_RESOURCE,
            compressed_id,
            room_id,
            now,
            action.as_str()
        ])? as u64;
    }
    Ok(inserted)
}

/// Run one scheduling sweep over every partition.
pub fn schedule_retention(store: &Store) -> Result<RetentionRun, ColdchainError> {
    let now = store.now();
    let hot_days = store.config.retention.hot_days;
    let cold_days = store.config.retention.cold_days;

    let run = audit::audited_write(store, "retention.schedule", |tx| {
        let resumed = holds::resume_unheld_entries(tx, None, now)? as u64;
        let mut hot_scheduled = 0u64;
        let mut cold_scheduled = 0u64;
        for table in partitions::all_tables(tx)? {
            let hot = due_records(tx, &table, RetentionAction::MoveToCold, hot_days, now)?;
            hot_scheduled += insert_entries(tx, &hot, RetentionAction::MoveToCold, now)?;
            let cold = due_records(tx, &table, RetentionAction::Delete, cold_days, now)?;
            cold_scheduled += insert_entries(tx, &cold, RetentionAction::Delete, now)?;
        }

        let events = if hot_scheduled + cold_scheduled > 0 {
            vec![AppendRequest::system(
                LifecycleEvent::RetentionScheduled {
                    hot_scheduled,
                    cold_scheduled,
                },
                "retention",
            )]
        } else {
            Vec::new()
        };
        Ok((
            RetentionRun {
                hot_scheduled,
                cold_scheduled,
                resumed,
                timestamp: time::epoch_z(now),
            },
            events,
        ))
    })?;

    tracing::info!(
        hot_scheduled = run.hot_scheduled,
        cold_scheduled = run.cold_scheduled,
        resumed = run.resumed,
        "retention sweep finished"
    );
    Ok(run)
}

/// Move a hot record to cold storage. Returns `false` without changes when the
/// record is no longer hot.
pub fn mark_cold_storage(store: &Store, compressed_id: &str, uri: &str) -> Result<bool, ColdchainError> {
    if uri.trim().is_empty() {
        return Err(ColdchainError::Validation(
            "cold storage uri must not be empty".to_string(),
        ));
    }
    let now = store.now();
    let moved = audit::audited_write(store, "retention.cold", |tx| {
        let table = compress::locate(tx, compressed_id)?;
        let changed = tx.execute(
            &format!(
                "UPDATE {table} SET lifecycle_state = 'cold', cold_storage_uri = ?1, updated_at = ?2
                 WHERE id = ?3 AND lifecycle_state = 'hot'"
            ),
            params![uri, now, compressed_id],
        )?;
        if changed == 0 {
            return Ok((false, Vec::new()));
        }
        tx.execute(
            "UPDATE retention_schedule SET status = 'done', updated_at = ?1
             WHERE resource_type = ?2 AND resource_id = ?3 AND action = 'move_to_cold' AND status != 'done'",
            params![now, COMPRESSED_RESOURCE, compressed_id],
        )?;
        let room_id: String = tx.query_row(
            &format!("SELECT room_id FROM {table} WHERE id = ?1"),
            [compressed_id],
            |row| row.get(0),
        )?;
        let ev = AppendRequest::system(
            LifecycleEvent::RecordCold {
                compressed_id: compressed_id.to_string(),
                uri: uri.to_string(),
            },
            "retention",
        )
        .in_room(&room_id);
        Ok((true, vec![ev]))
    })?;

    if moved {
        tracing::info!(compressed_id, uri, "record moved to cold storage");
    } else {
        tracing::debug!(compressed_id, "record already past hot; cold move skipped");
    }
    Ok(moved)
}

/// Set or clear (with `None`) a room's retention overrides.
pub fn set_room_retention(
    store: &Store,
    room_id: &str,
    hot_days: Option<i64>,
    cold_days: Option<i64>,
) -> Result<RoomRetention, ColdchainError> {
    if room_id.trim().is_empty() {
        return Err(ColdchainError::Validation("room_id must not be empty".to_string()));
    }
    for (name, days) in [("hot", hot_days), ("cold", cold_days)] {
        if matches!(days, Some(d) if d <= 0) {
            return Err(ColdchainError::Validation(format!(
                "{} retention days must be positive",
                name
            )));
        }
    }
    let now = store.now();
    store.broker().with_write("retention.room_set", |tx| {
        tx.execute(
            "INSERT INTO room_retention(room_id, retention_hot_days, retention_cold_days, updated_at)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(room_id) DO UPDATE SET
                retention_hot_days = excluded.retention_hot_days,
                retention_cold_days = excluded.retention_cold_days,
                updated_at = excluded.updated_at",
            params![room_id, hot_days, cold_days, now],
        )?;
        Ok(())
    })?;
    tracing::info!(room_id, ?hot_days, ?cold_days, "room retention override set");
    Ok(RoomRetention {
        room_id: room_id.to_string(),
        retention_hot_days: hot_days,
        retention_cold_days: cold_days,
        updated_at: now,
    })
}

pub fn get_room_retention(store: &Store, room_id: &str) -> Result<Option<RoomRetention>, ColdchainError> {
    store.broker().with_read("retention.room_get", |conn| {
        Ok(conn
            .query_row(
                "SELECT room_id, retention_hot_days, retention_cold_days, updated_at
                 FROM room_retention WHERE room_id = ?1",
                [room_id],
                |row| {
                    Ok(RoomRetention {
                        room_id: row.get(0)?,
                        retention_hot_days: row.get(1)?,
                        retention_cold_days: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    })
}

pub fn effective_retention(store: &Store, room_id: &str) -> Result<EffectiveRetention, ColdchainError> {
    let room = get_room_retention(store, room_id)?;
    let hot = room.as_ref().and_then(|r| r.retention_hot_days);
    let cold = room.as_ref().and_then(|r| r.retention_cold_days);
    Ok(EffectiveRetention {
        hot_days: hot.unwrap_or(store.config.retention.hot_days),
        cold_days: cold.unwrap_or(store.config.retention.cold_days),
        hot_overridden: hot.is_some(),
        cold_overridden: cold.is_some(),
    })
}

/// Pending entries whose time has come, oldest first.
pub fn due_entries(store: &Store, limit: usize) -> Result<Vec<ScheduleEntry>, ColdchainError> {
    let now = store.now();
    store.broker().with_read("retention.due", |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM retention_schedule
             WHERE status = 'pending' AND on_hold = 0 AND scheduled_for <= ?1
             ORDER BY scheduled_for ASC, created_at ASC, id ASC
             LIMIT ?2",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now, limit as i64], row_to_entry)?;
        collect_entries(rows)
    })
}

/// Every schedule entry for one resource, oldest first.
pub fn entries_for(
    store: &Store,
    resource_type: &str,
    resource_id: &str,
) -> Result<Vec<ScheduleEntry>, ColdchainError> {
    store.broker().with_read("retention.entries", |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM retention_schedule
             WHERE resource_type = ?1 AND resource_id = ?2
             ORDER BY created_at ASC, id ASC",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![resource_type, resource_id], row_to_entry)?;
        collect_entries(rows)
    })
}

/// Record that an executor could not carry out a pending entry.
pub fn mark_entry_failed(store: &Store, entry_id: &str, reason: &str) -> Result<(), ColdchainError> {
    let now = store.now();
    store.broker().with_write("retention.entry_fail", |tx| {
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM retention_schedule WHERE id = ?1",
                [entry_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status
            .ok_or_else(|| ColdchainError::NotFound(format!("schedule entry {}", entry_id)))?;
        if EntryStatus::parse(&status)? != EntryStatus::Pending {
            return Err(ColdchainError::Conflict(format!(
                "schedule entry {} is {}, not pending",
                entry_id, status
            )));
        }
        tx.execute(
            "UPDATE retention_schedule SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, now, entry_id],
        )?;
        Ok(())
    })?;
    tracing::warn!(entry_id, reason, "retention entry failed");
    Ok(())
}

/// Put a failed entry back in the due list. The entry keeps its id and
/// `scheduled_for`, so it is due again immediately; `last_error` stays until
/// the entry completes.
pub fn retry_entry(store: &Store, entry_id: &str) -> Result<(), ColdchainError> {
    let now = store.now();
    store.broker().with_write("retention.entry_retry", |tx| {
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM retention_schedule WHERE id = ?1",
                [entry_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status
            .ok_or_else(|| ColdchainError::NotFound(format!("schedule entry {}", entry_id)))?;
        if EntryStatus::parse(&status)? != EntryStatus::Failed {
            return Err(ColdchainError::Conflict(format!(
                "schedule entry {} is {}, not failed",
                entry_id, status
            )));
        }
        tx.execute(
            "UPDATE retention_schedule SET status = 'pending', updated_at = ?1 WHERE id = ?2",
            params![now, entry_id],
        )?;
        Ok(())
    })?;
    tracing::info!(entry_id, "retention entry requeued");
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(name = "retention", about = "Schedule and record lifecycle transitions.")]
pub struct RetentionCli {
    #[clap(subcommand)]
    pub command: RetentionCommand,
}

#[derive(Subcommand, Debug)]
pub enum RetentionCommand {
    /// Run one scheduling sweep.
    Schedule,
    /// Move a hot record to cold storage.
    Cold {
        #[clap(long)]
        id: String,
        #[clap(long)]
        uri: String,
    },
    /// List entries due for execution.
    Due {
        #[clap(long, default_value_t = 100)]
        limit: usize,
    },
    /// Mark a pending entry failed.
    Fail {
        #[clap(long)]
        entry: String,
        #[clap(long)]
        reason: String,
    },
    /// Return a failed entry to pending.
    Retry {
        #[clap(long)]
        entry: String,
    },
    /// Set a room's retention overrides (omit a flag to clear it).
    RoomSet {
        #[clap(long)]
        room: String,
        #[clap(long)]
        hot_days: Option<i64>,
        #[clap(long)]
        cold_days: Option<i64>,
    },
    /// Show a room's override and effective windows.
    RoomShow {
        #[clap(long)]
        room: String,
    },
}

pub fn run_retention_cli(
    store: &Store,
    cli: RetentionCli,
) -> Result<serde_json::Value, ColdchainError> {
    match cli.command {
        RetentionCommand::Schedule => {
            let run = schedule_retention(store)?;
            Ok(time::command_envelope(
                "retention.schedule",
                "ok",
                serde_json::json!({ "result": run }),
            ))
        }
        RetentionCommand::Cold { id, uri } => {
            let moved = mark_cold_storage(store, &id, &uri)?;
            Ok(time::command_envelope(
                "retention.cold",
                if moved { "ok" } else { "unchanged" },
                serde_json::json!({ "compressed_id": id, "moved": moved }),
            ))
        }
        RetentionCommand::Due { limit } => {
            let entries = due_entries(store, limit)?;
            Ok(time::command_envelope(
                "retention.due",
                "ok",
                serde_json::json!({ "entries": entries }),
            ))
        }
        RetentionCommand::Fail { entry, reason } => {
            mark_entry_failed(store, &entry, &reason)?;
            Ok(time::command_envelope(
                "retention.fail",
                "ok",
                serde_json::json!({ "entry_id": entry }),
            ))
        }
        RetentionCommand::Retry { entry } => {
            retry_entry(store, &entry)?;
            Ok(time::command_envelope(
                "retention.retry",
                "ok",
                serde_json::json!({ "entry_id": entry }),
            ))
        }
        RetentionCommand::RoomSet {
            room,
            hot_days,
            cold_days,
        } => {
            let row = set_room_retention(store, &room, hot_days, cold_days)?;
            Ok(time::command_envelope(
                "retention.room_set",
                "ok",
                serde_json::json!({ "room": row }),
            ))
        }
        RetentionCommand::RoomShow { room } => {
            let row = get_room_retention(store, &room)?;
            let effective = effective_retention(store, &room)?;
            Ok(time::command_envelope(
                "retention.room_show",
                "ok",
                serde_json::json!({ "override": row, "effective": effective }),
            ))
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "retention",
        "version": "0.1.0",
        "description": "Hot/cold/delete retention scheduling with per-room overrides",
        "commands": [
            { "name": "schedule", "parameters": [] },
            { "name": "cold", "parameters": ["id", "uri"] },
            { "name": "due", "parameters": ["limit"] },
            { "name": "fail", "parameters": ["entry", "reason"] },
            { "name": "retry", "parameters": ["entry"] },
            { "name": "room-set", "parameters": ["room", "hot_days", "cold_days"] },
            { "name": "room-show", "parameters": ["room"] }
        ],
        "storage": ["coldchain.db:retention_schedule", "coldchain.db:room_retention"]
    })
}
