//! Monthly partitions of the compressed store.
//!
//! Each `YYYY_MM` key owns a physical table `logs_compressed_YYYY_MM` whose
//! rows are constrained to `[month_start, next_month_start)`. The table
//! `logs_compressed_default` is the overflow partition: records whose key has
//! no explicit partition land there, and creating the partition later moves
//! them across. `compressed_partitions` is the registry and
//! `compressed_locator` maps each record id to the table holding it.

use crate::core::error::ColdchainError;
use crate::core::schemas::{self, COMPRESSED_COLUMNS, DEFAULT_PARTITION_KEY};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::audit::{self, AppendRequest, LifecycleEvent};
use crate::plugins::holds;
use clap::{Parser, Subcommand};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::sync::OnceLock;

fn key_pattern() -> &'static Regex {
    static KEY_RE: OnceLock<Regex> = OnceLock::new();
    KEY_RE.get_or_init(|| Regex::new(r"^([0-9]{4})_(0[1-9]|1[0-2])$").expect("valid regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn parse(key: &str) -> Result<Self, ColdchainError> {
        let caps = key_pattern().captures(key).ok_or_else(|| {
            ColdchainError::Validation(format!(
                "partition key '{}' does not match YYYY_MM",
                key
            ))
        })?;
        let year = caps[1]
            .parse()
            .map_err(|_| ColdchainError::Validation(format!("bad year in '{}'", key)))?;
        let month = caps[2]
            .parse()
            .map_err(|_| ColdchainError::Validation(format!("bad month in '{}'", key)))?;
        Ok(Self { year, month })
    }

    pub fn for_timestamp(secs: i64) -> Self {
        // partition_key_for always yields a well-formed key
        Self::parse(&time::partition_key_for(secs)).unwrap_or(Self {
            year: 1970,
            month: 1,
        })
    }

    pub fn as_key(&self) -> String {
        format!("{:04}_{:02}", self.year, self.month)
    }

    pub fn table_name(&self) -> String {
        table_name_for(&self.as_key())
    }

    pub fn bounds(&self) -> Result<(i64, i64), ColdchainError> {
        time::month_bounds(self.year, self.month).ok_or_else(|| {
            ColdchainError::Validation(format!("no calendar month for '{}'", self.as_key()))
        })
    }
}

pub fn table_name_for(key: &str) -> String {
    format!("{}_{}", schemas::COMPRESSED_TABLE_PREFIX, key)
}

pub fn default_table() -> String {
    table_name_for(DEFAULT_PARTITION_KEY)
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition_key: String,
    pub table_name: String,
    pub range_start: Option<i64>,
    pub range_end: Option<i64>,
    pub rows: i64,
    pub bytes: i64,
}

/// Registered table for `key`, if its partition exists.
pub(crate) fn registered_table(
    conn: &Connection,
    key: &str,
) -> Result<Option<String>, ColdchainError> {
    Ok(conn
        .query_row(
            "SELECT table_name FROM compressed_partitions WHERE partition_key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Every partition table, explicit months first, overflow last.
pub(crate) fn all_tables(conn: &Connection) -> Result<Vec<String>, ColdchainError> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM compressed_partitions
         ORDER BY partition_key = ?1, partition_key ASC",
    )?;
    let rows = stmt.query_map([DEFAULT_PARTITION_KEY], |row| row.get(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Create the partition for `key` inside an open transaction, moving any
/// overflow rows that belong to it. Returns the table name and, when the
/// partition is new, the audit event describing the creation.
pub(crate) fn ensure_partition_in_tx(
    conn: &Connection,
    key: &PartitionKey,
    now: i64,
) -> Result<(String, Option<LifecycleEvent>), ColdchainError> {
    let key_text = key.as_key();
    if let Some(table) = registered_table(conn, &key_text)? {
        return Ok((table, None));
    }

    let table = key.table_name();
    let bounds = key.bounds()?;
    conn.execute_batch(&schemas::compressed_table_ddl(&table, Some(bounds)))?;
    conn.execute(
        "INSERT INTO compressed_partitions(partition_key, table_name, range_start, range_end, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5)",
        params![key_text, table, bounds.0, bounds.1, now],
    )?;

    let overflow = default_table();
    let moved = conn.execute(
        &format!(
            "INSERT INTO {table} ({cols}) SELECT {cols} FROM {overflow} WHERE partition_key = ?1",
            cols = COMPRESSED_COLUMNS
        ),
        [&key_text],
    )?;
    if moved > 0 {
        conn.execute(
            &format!("DELETE FROM {overflow} WHERE partition_key = ?1"),
            [&key_text],
        )?;
        conn.execute(
            "UPDATE compressed_locator SET table_name = ?1 WHERE partition_key = ?2",
            params![table, key_text],
        )?;
    }

    tracing::info!(partition_key = %key_text, table = %table, moved_rows = moved, "partition created");
    Ok((
        table.clone(),
        Some(LifecycleEvent::PartitionCreated {
            partition_key: key_text,
            table_name: table,
            moved_rows: moved as u64,
        }),
    ))
}

/// Idempotently create the partition for a `YYYY_MM` key and return its
/// table name. Safe under concurrent and repeated calls.
pub fn create_partition_if_needed(store: &Store, partition_key: &str) -> Result<String, ColdchainError> {
    let key = PartitionKey::parse(partition_key)?;
    let now = store.now();
    audit::audited_write(store, "partition.ensure", |tx| {
        let (table, ev) = ensure_partition_in_tx(tx, &key, now)?;
        let events = ev
            .map(|e| vec![AppendRequest::system(e, "partitions")])
            .unwrap_or_default();
        Ok((table, events))
    })
}

pub fn list_partitions(store: &Store) -> Result<Vec<PartitionInfo>, ColdchainError> {
    store.broker().with_read("partition.list", |conn| {
        let registry: Vec<(String, String, Option<i64>, Option<i64>)> = {
            let mut stmt = conn.prepare(
                "SELECT partition_key, table_name, range_start, range_end FROM compressed_partitions
                 ORDER BY partition_key = ?1, partition_key ASC",
            )?;
            let rows = stmt.query_map([DEFAULT_PARTITION_KEY], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut out = Vec::with_capacity(registry.len());
        for (partition_key, table_name, range_start, range_end) in registry {
            let (rows, bytes): (i64, i64) = conn.query_row(
                &format!(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(compressed_bytes)), 0) FROM {}",
                    table_name
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            out.push(PartitionInfo {
                partition_key,
                table_name,
                range_start,
                range_end,
                rows,
                bytes,
            });
        }
        Ok(out)
    })
}

/// Drop a month partition and everything in it. The overflow partition can
/// never be dropped, and a partition holding records under legal hold is
/// refused.
pub fn drop_partition(store: &Store, partition_key: &str) -> Result<u64, ColdchainError> {
    if partition_key == DEFAULT_PARTITION_KEY {
        return Err(ColdchainError::Validation(
            "refusing to drop the default overflow partition".to_string(),
        ));
    }
    let key = PartitionKey::parse(partition_key)?;
    let key_text = key.as_key();
    let now = store.now();

    let rows = audit::audited_write(store, "partition.drop", |tx| {
        let table = registered_table(tx, &key_text)?
            .ok_or_else(|| ColdchainError::NotFound(format!("partition {}", key_text)))?;

        let held: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(*) FROM {table} c WHERE {}",
                holds::ACTIVE_HOLD_PREDICATE
            ),
            rusqlite::named_params! { ":now": now },
            |row| row.get(0),
        )?;
        if held > 0 {
            return Err(ColdchainError::Conflict(format!(
                "partition {} holds {} record(s) under legal hold",
                key_text, held
            )));
        }

        let rows: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        tx.execute(
            &format!(
                "UPDATE retention_schedule SET status = 'done', updated_at = ?1
                 WHERE resource_type = ?2 AND status != 'done'
                   AND resource_id IN (SELECT id FROM {table})"
            ),
            params![now, schemas::COMPRESSED_RESOURCE],
        )?;
        tx.execute(
            "DELETE FROM compressed_locator WHERE table_name = ?1",
            [&table],
        )?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
        tx.execute(
            "DELETE FROM compressed_partitions WHERE partition_key = ?1",
            [&key_text],
        )?;

        let ev = AppendRequest::system(
            LifecycleEvent::PartitionDropped {
                partition_key: key_text.clone(),
                rows: rows as u64,
            },
            "partitions",
        );
        Ok((rows as u64, vec![ev]))
    })?;

    tracing::info!(partition_key = %key_text, rows, "partition dropped");
    Ok(rows)
}

#[derive(Parser, Debug)]
#[clap(name = "partition", about = "Manage monthly partitions of the compressed store.")]
pub struct PartitionCli {
    #[clap(subcommand)]
    pub command: PartitionCommand,
}

#[derive(Subcommand, Debug)]
pub enum PartitionCommand {
    /// Create the partition for a YYYY_MM key if it does not exist.
    Ensure {
        #[clap(long)]
        key: String,
    },
    /// List partitions with row counts and payload bytes.
    List,
    /// Drop a month partition.
    Drop {
        #[clap(long)]
        key: String,
    },
}

pub fn run_partition_cli(
    store: &Store,
    cli: PartitionCli,
) -> Result<serde_json::Value, ColdchainError> {
    match cli.command {
        PartitionCommand::Ensure { key } => {
            let table = create_partition_if_needed(store, &key)?;
            Ok(time::command_envelope(
                "partition.ensure",
                "ok",
                serde_json::json!({ "partition_key": key, "table_name": table }),
            ))
        }
        PartitionCommand::List => {
            let partitions = list_partitions(store)?;
            Ok(time::command_envelope(
                "partition.list",
                "ok",
                serde_json::json!({ "partitions": partitions }),
            ))
        }
        PartitionCommand::Drop { key } => {
            let rows = drop_partition(store, &key)?;
            Ok(time::command_envelope(
                "partition.drop",
                "ok",
                serde_json::json!({ "partition_key": key, "rows": rows }),
            ))
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "partition",
        "version": "0.1.0",
        "description": "Monthly partitions with a default overflow partition",
        "commands": [
            { "name": "ensure", "parameters": ["key"] },
            { "name": "list", "parameters": [] },
            { "name": "drop", "parameters": ["key"] }
        ],
        "storage": ["coldchain.db:compressed_partitions", "coldchain.db:logs_compressed_*"]
    })
}
