//! Legal hold registry.
//!
//! A hold is a pure exclusion predicate: while `hold_until > now`, the held
//! resource gains no new retention schedule entries and its pending entries
//! are parked as `on_hold`. Holds target a single compressed record
//! (`logs_compressed`) or a whole room (`room`). Holds never move or delete
//! data themselves.

use crate::core::error::ColdchainError;
use crate::core::schemas::{COMPRESSED_RESOURCE, ROOM_RESOURCE};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::audit::{self, AppendRequest, LifecycleEvent};
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, named_params, params};
use serde::Serialize;

/// True when compressed row `c` (columns `id`, `room_id`) is under an active
/// hold. Binds `:now`.
pub const ACTIVE_HOLD_PREDICATE: &str = "EXISTS (SELECT 1 FROM legal_holds h
    WHERE h.hold_until > :now
      AND ((h.resource_type = 'logs_compressed' AND h.resource_id = c.id)
        OR (h.resource_type = 'room' AND h.resource_id = c.room_id)))";

/// Same test for a `retention_schedule` row. Binds `:now`.
const ENTRY_HELD_PREDICATE: &str = "EXISTS (SELECT 1 FROM legal_holds h
    WHERE h.hold_until > :now
      AND ((h.resource_type = retention_schedule.resource_type
            AND h.resource_id = retention_schedule.resource_id)
        OR (h.resource_type = 'room' AND h.resource_id = retention_schedule.room_id)))";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldTarget {
    LogsCompressed,
    Room,
}

impl HoldTarget {
    pub fn parse(s: &str) -> Result<Self, ColdchainError> {
        match s {
            COMPRESSED_RESOURCE => Ok(HoldTarget::LogsCompressed),
            ROOM_RESOURCE => Ok(HoldTarget::Room),
            other => Err(ColdchainError::Validation(format!(
                "unsupported hold resource type '{}' (expected '{}' or '{}')",
                other, COMPRESSED_RESOURCE, ROOM_RESOURCE
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HoldTarget::LogsCompressed => COMPRESSED_RESOURCE,
            HoldTarget::Room => ROOM_RESOURCE,
        }
    }

    /// Column of `retention_schedule` a hold of this type matches against.
    fn schedule_column(self) -> &'static str {
        match self {
            HoldTarget::LogsCompressed => "resource_id",
            HoldTarget::Room => "room_id",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LegalHold {
    pub id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub hold_until: i64,
    pub reason: String,
    pub actor: String,
    pub created_at: i64,
}

/// Whether a compressed record (or its room) is under an active hold.
pub(crate) fn is_held(
    conn: &Connection,
    compressed_id: &str,
    room_id: &str,
    now: i64,
) -> Result<bool, ColdchainError> {
    let held: i64 = conn.query_row(
        &format!(
            "SELECT {} FROM (SELECT :id AS id, :room AS room_id) c",
            ACTIVE_HOLD_PREDICATE
        ),
        named_params! { ":now": now, ":id": compressed_id, ":room": room_id },
        |row| row.get(0),
    )?;
    Ok(held != 0)
}

/// Put pending schedule entries of a held resource on hold.
fn pause_entries(
    conn: &Connection,
    target: HoldTarget,
    resource_id: &str,
    reason: &str,
    now: i64,
) -> Result<usize, ColdchainError> {
    let type_filter = match target {
        HoldTarget::LogsCompressed => "AND resource_type = 'logs_compressed'",
        HoldTarget::Room => "",
    };
    Ok(conn.execute(
        &format!(
            "UPDATE retention_schedule
             SET on_hold = 1, status = 'on_hold', hold_reason = ?1, updated_at = ?2
             WHERE {} = ?3 {} AND status = 'pending'",
            target.schedule_column(),
            type_filter
        ),
        params![reason, now, resource_id],
    )?)
}

/// Return `on_hold` entries to `pending` when no active hold covers them any
/// more. `scope` narrows the scan to one released resource.
pub(crate) fn resume_unheld_entries(
    conn: &Connection,
    scope: Option<(HoldTarget, &str)>,
    now: i64,
) -> Result<usize, ColdchainError> {
    let (scope_sql, scope_id) = match scope {
        Some((target, id)) => (format!("AND {} = :scope_id", target.schedule_column()), id),
        None => (String::new(), ""),
    };
    let sql = format!(
        "UPDATE retention_schedule
         SET on_hold = 0, status = 'pending', hold_reason = NULL, updated_at = :now
         WHERE status = 'on_hold' {} AND NOT {}",
        scope_sql, ENTRY_HELD_PREDICATE
    );
    let changed = if scope.is_some() {
        conn.execute(&sql, named_params! { ":now": now, ":scope_id": scope_id })?
    } else {
        conn.execute(&sql, named_params! { ":now": now })?
    };
    Ok(changed)
}

/// Expiry `days` whole days after `now`.
pub fn hold_until_after_days(now: i64, days: i64) -> Result<i64, ColdchainError> {
    days.checked_mul(time::SECS_PER_DAY)
        .and_then(|secs| now.checked_add(secs))
        .ok_or_else(|| {
            ColdchainError::Validation(format!("hold of {} days is out of range", days))
        })
}

/// Place (or extend) a legal hold. Re-applying an existing hold keeps the
/// later `hold_until` and refreshes reason and actor.
pub fn apply_hold(
    store: &Store,
    resource_type: &str,
    resource_id: &str,
    hold_until: i64,
    reason: &str,
    actor: &str,
) -> Result<String, ColdchainError> {
    let target = HoldTarget::parse(resource_type)?;
    if resource_id.trim().is_empty() {
        return Err(ColdchainError::Validation(
            "resource_id must not be empty".to_string(),
        ));
    }
    let now = store.now();
    if hold_until <= now {
        return Err(ColdchainError::Validation(format!(
            "hold_until {} is not in the future",
            time::epoch_z(hold_until)
        )));
    }
    let new_id = time::new_id();

    let (hold_id, paused) = audit::audited_write(store, "hold.apply", |tx| {
        tx.execute(
            "INSERT INTO legal_holds(id, resource_type, resource_id, hold_until, reason, actor, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(resource_type, resource_id) DO UPDATE SET
                hold_until = MAX(legal_holds.hold_until, excluded.hold_until),
                reason = excluded.reason,
                actor = excluded.actor",
            params![new_id, target.as_str(), resource_id, hold_until, reason, actor, now],
        )?;
        let (hold_id, effective_until): (String, i64) = tx.query_row(
            "SELECT id, hold_until FROM legal_holds WHERE resource_type = ?1 AND resource_id = ?2",
            params![target.as_str(), resource_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let paused = pause_entries(tx, target, resource_id, reason, now)?;

        let ev = AppendRequest::system(
            LifecycleEvent::HoldApplied {
                resource_type: target.as_str().to_string(),
                resource_id: resource_id.to_string(),
                hold_until: effective_until,
                reason: reason.to_string(),
            },
            actor,
        );
        Ok(((hold_id, paused), vec![ev]))
    })?;

    tracing::info!(
        hold_id = %hold_id,
        resource_type = target.as_str(),
        resource_id,
        paused_entries = paused,
        "legal hold applied"
    );
    Ok(hold_id)
}

/// Remove a hold and resume the schedule entries it was parking, unless
/// another active hold still covers them.
pub fn release_hold(
    store: &Store,
    resource_type: &str,
    resource_id: &str,
) -> Result<usize, ColdchainError> {
    let target = HoldTarget::parse(resource_type)?;
    let now = store.now();

    let resumed = audit::audited_write(store, "hold.release", |tx| {
        let removed = tx.execute(
            "DELETE FROM legal_holds WHERE resource_type = ?1 AND resource_id = ?2",
            params![target.as_str(), resource_id],
        )?;
        if removed == 0 {
            return Err(ColdchainError::NotFound(format!(
                "legal hold on {} {}",
                target.as_str(),
                resource_id
            )));
        }
        let resumed = resume_unheld_entries(tx, Some((target, resource_id)), now)?;
        let ev = AppendRequest::system(
            LifecycleEvent::HoldReleased {
                resource_type: target.as_str().to_string(),
                resource_id: resource_id.to_string(),
            },
            "holds",
        );
        Ok((resumed, vec![ev]))
    })?;

    tracing::info!(
        resource_type = target.as_str(),
        resource_id,
        resumed_entries = resumed,
        "legal hold released"
    );
    Ok(resumed)
}

pub fn get_hold(
    store: &Store,
    resource_type: &str,
    resource_id: &str,
) -> Result<Option<LegalHold>, ColdchainError> {
    store.broker().with_read("hold.get", |conn| {
        Ok(conn
            .query_row(
                "SELECT id, resource_type, resource_id, hold_until, reason, actor, created_at
                 FROM legal_holds WHERE resource_type = ?1 AND resource_id = ?2",
                params![resource_type, resource_id],
                row_to_hold,
            )
            .optional()?)
    })
}

pub fn list_holds(store: &Store, active_only: bool) -> Result<Vec<LegalHold>, ColdchainError> {
    let now = store.now();
    store.broker().with_read("hold.list", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, resource_type, resource_id, hold_until, reason, actor, created_at
             FROM legal_holds WHERE (?1 = 0 OR hold_until > ?2)
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![active_only, now], row_to_hold)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    })
}

fn row_to_hold(row: &rusqlite::Row<'_>) -> rusqlite::Result<LegalHold> {
    Ok(LegalHold {
        id: row.get(0)?,
        resource_type: row.get(1)?,
        resource_id: row.get(2)?,
        hold_until: row.get(3)?,
        reason: row.get(4)?,
        actor: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[derive(Parser, Debug)]
#[clap(name = "hold", about = "Apply and release legal holds.")]
pub struct HoldCli {
    #[clap(subcommand)]
    pub command: HoldCommand,
}

#[derive(Subcommand, Debug)]
pub enum HoldCommand {
    /// Apply (or extend) a hold on a record or room.
    Apply {
        /// `logs_compressed` or `room`.
        #[clap(long)]
        resource_type: String,
        #[clap(long)]
        resource_id: String,
        /// Hold duration in days from now.
        #[clap(long)]
        days: i64,
        #[clap(long)]
        reason: String,
        #[clap(long)]
        actor: String,
    },
    /// Release a hold.
    Release {
        #[clap(long)]
        resource_type: String,
        #[clap(long)]
        resource_id: String,
    },
    /// List holds.
    List {
        /// Include expired holds.
        #[clap(long)]
        all: bool,
    },
}

pub fn run_hold_cli(store: &Store, cli: HoldCli) -> Result<serde_json::Value, ColdchainError> {
    match cli.command {
        HoldCommand::Apply {
            resource_type,
            resource_id,
            days,
            reason,
            actor,
        } => {
            let hold_until = hold_until_after_days(store.now(), days)?;
            let hold_id = apply_hold(store, &resource_type, &resource_id, hold_until, &reason, &actor)?;
            Ok(time::command_envelope(
                "hold.apply",
                "ok",
                serde_json::json!({ "hold_id": hold_id, "hold_until": hold_until }),
            ))
        }
        HoldCommand::Release {
            resource_type,
            resource_id,
        } => {
            let resumed = release_hold(store, &resource_type, &resource_id)?;
            Ok(time::command_envelope(
                "hold.release",
                "ok",
                serde_json::json!({ "resumed_entries": resumed }),
            ))
        }
        HoldCommand::List { all } => {
            let holds = list_holds(store, !all)?;
            Ok(time::command_envelope(
                "hold.list",
                "ok",
                serde_json::json!({ "holds": holds }),
            ))
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "hold",
        "version": "0.1.0",
        "description": "Legal holds that exclude resources from retention scheduling",
        "commands": [
            { "name": "apply", "parameters": ["resource_type", "resource_id", "days", "reason", "actor"] },
            { "name": "release", "parameters": ["resource_type", "resource_id"] },
            { "name": "list", "parameters": ["all"] }
        ],
        "storage": ["coldchain.db:legal_holds"]
    })
}
