//! Compression stage and compressed-record lifecycle.
//!
//! `encode_raw_to_compressed` is the durability boundary an external codec
//! executor calls after doing the actual compression. It enforces
//! exactly-once compression per raw record through the `processed` flag and
//! the unique `raw_id` in `compressed_locator`.

use crate::core::error::ColdchainError;
use crate::core::schemas::COMPRESSED_RESOURCE;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::audit::{self, AppendRequest, LifecycleEvent};
use crate::plugins::holds;
use crate::plugins::partitions::{self, PartitionKey};
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Hot,
    Cold,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Hot => "hot",
            LifecycleState::Cold => "cold",
            LifecycleState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ColdchainError> {
        match s {
            "hot" => Ok(LifecycleState::Hot),
            "cold" => Ok(LifecycleState::Cold),
            "deleted" => Ok(LifecycleState::Deleted),
            other => Err(ColdchainError::Validation(format!(
                "unknown lifecycle state '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CompressedRecord {
    pub id: String,
    pub raw_id: String,
    pub room_id: String,
    pub partition_key: String,
    pub table_name: String,
    pub created_at: i64,
    pub codec: String,
    pub original_length: i64,
    pub compressed_length: i64,
    pub checksum: String,
    pub cold_storage_uri: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub purged: bool,
    pub updated_at: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DisposeOutcome {
    pub compressed_id: String,
    pub lifecycle_state: LifecycleState,
    pub purged: bool,
    /// False when the call found the record already in the requested state.
    pub changed: bool,
}

/// Partition table currently holding `compressed_id`.
pub(crate) fn locate(conn: &Connection, compressed_id: &str) -> Result<String, ColdchainError> {
    conn.query_row(
        "SELECT table_name FROM compressed_locator WHERE id = ?1",
        [compressed_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| ColdchainError::NotFound(format!("compressed record {}", compressed_id)))
}

/// Compressed record id produced from `raw_id`, if it was compressed.
pub fn compressed_id_for_raw(store: &Store, raw_id: &str) -> Result<Option<String>, ColdchainError> {
    store.broker().with_read("compress.lookup", |conn| {
        Ok(conn
            .query_row(
                "SELECT id FROM compressed_locator WHERE raw_id = ?1",
                [raw_id],
                |row| row.get(0),
            )
            .optional()?)
    })
}

pub(crate) fn load_record(
    conn: &Connection,
    compressed_id: &str,
) -> Result<CompressedRecord, ColdchainError> {
    let table = locate(conn, compressed_id)?;
    let (record, state) = conn.query_row(
        &format!(
            "SELECT id, raw_id, room_id, partition_key, created_at, codec, original_length,
                    LENGTH(compressed_bytes), checksum, cold_storage_uri, lifecycle_state, purged, updated_at
             FROM {table} WHERE id = ?1"
        ),
        [compressed_id],
        |row| {
            Ok((
                CompressedRecord {
                    id: row.get(0)?,
                    raw_id: row.get(1)?,
                    room_id: row.get(2)?,
                    partition_key: row.get(3)?,
                    table_name: table.clone(),
                    created_at: row.get(4)?,
                    codec: row.get(5)?,
                    original_length: row.get(6)?,
                    compressed_length: row.get(7)?,
                    checksum: row.get(8)?,
                    cold_storage_uri: row.get(9)?,
                    lifecycle_state: LifecycleState::Hot,
                    purged: row.get(11)?,
                    updated_at: row.get(12)?,
                },
                row.get::<_, String>(10)?,
            ))
        },
    )?;
    Ok(CompressedRecord {
        lifecycle_state: LifecycleState::parse(&state)?,
        ..record
    })
}

/// Persist externally-compressed bytes for a raw record and return the new
/// compressed record id. A raw record already processed is a `Conflict`.
pub fn encode_raw_to_compressed(
    store: &Store,
    raw_id: &str,
    codec: &str,
    compressed_bytes: &[u8],
) -> Result<String, ColdchainError> {
    if codec.trim().is_empty() {
        return Err(ColdchainError::Validation("codec must not be empty".to_string()));
    }
    let compressed_id = time::new_id();
    let checksum = audit::sha256_hex(compressed_bytes);
    let now = store.now();
    let auto_create = store.config.partitions.auto_create;

    let (partition_key, table) = audit::audited_write(store, "compress.encode", |tx| {
        let raw: Option<(String, i64, i64, bool)> = tx
            .query_row(
                "SELECT room_id, created_at, length, processed FROM raw_records WHERE id = ?1",
                [raw_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let (room_id, created_at, original_length, processed) =
            raw.ok_or_else(|| ColdchainError::NotFound(format!("raw record {}", raw_id)))?;
        if processed {
            return Err(ColdchainError::Conflict(format!(
                "raw record {} is already compressed",
                raw_id
            )));
        }

        let key = PartitionKey::for_timestamp(created_at);
        let key_text = key.as_key();
        let mut events = Vec::new();
        let table = match partitions::registered_table(tx, &key_text)? {
            Some(table) => table,
            None if auto_create => {
                let (table, ev) = partitions::ensure_partition_in_tx(tx, &key, now)?;
                if let Some(ev) = ev {
                    events.push(AppendRequest::system(ev, "partitions"));
                }
                table
            }
            None => partitions::default_table(),
        };

        tx.execute(
            &format!(
                "INSERT INTO {table} (id, raw_id, room_id, partition_key, created_at, codec,
                                      compressed_bytes, original_length, checksum, lifecycle_state,
                                      purged, updated_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'hot', 0, ?10)"
            ),
            params![
                compressed_id,
                raw_id,
                room_id,
                key_text,
                created_at,
                codec,
                compressed_bytes,
                original_length,
                checksum,
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO compressed_locator(id, raw_id, partition_key, table_name) VALUES(?1, ?2, ?3, ?4)",
            params![compressed_id, raw_id, key_text, table],
        )?;
        let flipped = tx.execute(
            "UPDATE raw_records SET processed = 1 WHERE id = ?1 AND processed = 0",
            [raw_id],
        )?;
        if flipped != 1 {
            return Err(ColdchainError::Conflict(format!(
                "raw record {} is already compressed",
                raw_id
            )));
        }

        events.push(
            AppendRequest::system(
                LifecycleEvent::RecordCompressed {
                    raw_id: raw_id.to_string(),
                    compressed_id: compressed_id.clone(),
                    partition_key: key_text.clone(),
                    codec: codec.to_string(),
                    original_length,
                    compressed_length: compressed_bytes.len() as i64,
                },
                "compress",
            )
            .in_room(&room_id),
        );
        Ok(((key_text, table), events))
    })?;

    tracing::info!(
        raw_id,
        compressed_id = %compressed_id,
        partition_key = %partition_key,
        table = %table,
        codec,
        "raw record compressed"
    );
    Ok(compressed_id)
}

pub fn get_compressed(store: &Store, compressed_id: &str) -> Result<CompressedRecord, ColdchainError> {
    store
        .broker()
        .with_read("compress.get", |conn| load_record(conn, compressed_id))
}

/// Return the stored compressed bytes after checking them against the
/// recorded checksum. Deleted records are `NotFound`.
pub fn fetch_compressed(store: &Store, compressed_id: &str) -> Result<Vec<u8>, ColdchainError> {
    store.broker().with_read("compress.fetch", |conn| {
        let record = load_record(conn, compressed_id)?;
        if record.lifecycle_state == LifecycleState::Deleted {
            return Err(ColdchainError::NotFound(format!(
                "compressed record {} is deleted",
                compressed_id
            )));
        }
        let bytes: Vec<u8> = conn.query_row(
            &format!("SELECT compressed_bytes FROM {} WHERE id = ?1", record.table_name),
            [compressed_id],
            |row| row.get(0),
        )?;
        let actual = audit::sha256_hex(&bytes);
        if actual != record.checksum {
            tracing::error!(compressed_id, expected = %record.checksum, actual = %actual, "compressed payload checksum mismatch");
            return Err(ColdchainError::Integrity {
                what: format!("compressed record {}", compressed_id),
                expected: record.checksum,
                actual,
            });
        }
        Ok(bytes)
    })
}

/// Mark a record deleted. With `purge` the payload bytes are discarded too.
/// Refused while the record or its room is under an active legal hold.
pub fn dispose(
    store: &Store,
    compressed_id: &str,
    purge: bool,
) -> Result<DisposeOutcome, ColdchainError> {
    let now = store.now();
    let outcome = audit::audited_write(store, "compress.dispose", |tx| {
        let record = load_record(tx, compressed_id)?;
        if holds::is_held(tx, &record.id, &record.room_id, now)? {
            return Err(ColdchainError::Conflict(format!(
                "compressed record {} is under legal hold",
                compressed_id
            )));
        }

        let already_deleted = record.lifecycle_state == LifecycleState::Deleted;
        let needs_purge = purge && !record.purged;
        if already_deleted && !needs_purge {
            return Ok((
                DisposeOutcome {
                    compressed_id: record.id,
                    lifecycle_state: LifecycleState::Deleted,
                    purged: record.purged,
                    changed: false,
                },
                Vec::new(),
            ));
        }

        if needs_purge {
            tx.execute(
                &format!(
                    "UPDATE {} SET lifecycle_state = 'deleted', compressed_bytes = X'', purged = 1,
                            updated_at = ?1
                     WHERE id = ?2",
                    record.table_name
                ),
                params![now, compressed_id],
            )?;
        } else {
            tx.execute(
                &format!(
                    "UPDATE {} SET lifecycle_state = 'deleted', updated_at = ?1 WHERE id = ?2",
                    record.table_name
                ),
                params![now, compressed_id],
            )?;
        }
        tx.execute(
            "UPDATE retention_schedule SET status = 'done', updated_at = ?1
             WHERE resource_type = ?2 AND resource_id = ?3 AND status != 'done'",
            params![now, COMPRESSED_RESOURCE, compressed_id],
        )?;

        let purged = record.purged || needs_purge;
        let ev = AppendRequest::system(
            LifecycleEvent::RecordDisposed {
                compressed_id: compressed_id.to_string(),
                purged,
            },
            "compress",
        )
        .in_room(&record.room_id);
        Ok((
            DisposeOutcome {
                compressed_id: record.id,
                lifecycle_state: LifecycleState::Deleted,
                purged,
                changed: true,
            },
            vec![ev],
        ))
    })?;

    if outcome.changed {
        tracing::info!(compressed_id, purged = outcome.purged, "compressed record disposed");
    }
    Ok(outcome)
}

#[derive(Parser, Debug)]
#[clap(name = "compress", about = "Store and manage compressed records.")]
pub struct CompressCli {
    #[clap(subcommand)]
    pub command: CompressCommand,
}

#[derive(Subcommand, Debug)]
pub enum CompressCommand {
    /// Store already-compressed bytes for a raw record.
    Encode {
        #[clap(long)]
        raw: String,
        #[clap(long)]
        codec: String,
        /// File holding the compressed bytes.
        #[clap(long)]
        file: PathBuf,
    },
    /// Fetch compressed bytes, verifying the checksum.
    Fetch {
        #[clap(long)]
        id: String,
        /// Write the bytes here instead of only reporting their size.
        #[clap(long)]
        out: Option<PathBuf>,
    },
    /// Show compressed record metadata.
    Show {
        #[clap(long)]
        id: String,
    },
    /// Mark a record deleted, optionally purging its bytes.
    Dispose {
        #[clap(long)]
        id: String,
        #[clap(long)]
        purge: bool,
    },
}

pub fn run_compress_cli(
    store: &Store,
    cli: CompressCli,
) -> Result<serde_json::Value, ColdchainError> {
    match cli.command {
        CompressCommand::Encode { raw, codec, file } => {
            let bytes = fs::read(&file).map_err(ColdchainError::Io)?;
            let compressed_id = encode_raw_to_compressed(store, &raw, &codec, &bytes)?;
            Ok(time::command_envelope(
                "compress.encode",
                "ok",
                serde_json::json!({ "raw_id": raw, "compressed_id": compressed_id }),
            ))
        }
        CompressCommand::Fetch { id, out } => {
            let bytes = fetch_compressed(store, &id)?;
            if let Some(path) = &out {
                fs::write(path, &bytes).map_err(ColdchainError::Io)?;
            }
            Ok(time::command_envelope(
                "compress.fetch",
                "ok",
                serde_json::json!({
                    "compressed_id": id,
                    "length": bytes.len(),
                    "checksum": audit::sha256_hex(&bytes),
                    "written_to": out,
                }),
            ))
        }
        CompressCommand::Show { id } => {
            let record = get_compressed(store, &id)?;
            Ok(time::command_envelope(
                "compress.show",
                "ok",
                serde_json::json!({ "record": record }),
            ))
        }
        CompressCommand::Dispose { id, purge } => {
            let outcome = dispose(store, &id, purge)?;
            Ok(time::command_envelope(
                "compress.dispose",
                "ok",
                serde_json::json!({ "result": outcome }),
            ))
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "compress",
        "version": "0.1.0",
        "description": "Exactly-once compression boundary and compressed record lifecycle",
        "commands": [
            { "name": "encode", "parameters": ["raw", "codec", "file"] },
            { "name": "fetch", "parameters": ["id", "out"] },
            { "name": "show", "parameters": ["id"] },
            { "name": "dispose", "parameters": ["id", "purge"] }
        ],
        "storage": ["coldchain.db:logs_compressed_*", "coldchain.db:compressed_locator"]
    })
}
