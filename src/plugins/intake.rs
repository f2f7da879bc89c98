use crate::core::error::ColdchainError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::audit::{self, AppendRequest, LifecycleEvent};
use clap::{Parser, Subcommand};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub id: String,
    pub room_id: String,
    pub created_at: i64,
    #[serde(skip_serializing)]
    pub payload: Vec<u8>,
    pub mime_type: String,
    pub length: i64,
    pub checksum: String,
    pub processed: bool,
}

/// Persist a raw payload and return its id. The checksum is the hex SHA-256
/// of the payload bytes.
pub fn intake(
    store: &Store,
    room_id: &str,
    payload: &[u8],
    mime_type: &str,
) -> Result<String, ColdchainError> {
    if room_id.trim().is_empty() {
        return Err(ColdchainError::Validation("room_id must not be empty".to_string()));
    }
    if mime_type.trim().is_empty() {
        return Err(ColdchainError::Validation("mime_type must not be empty".to_string()));
    }

    let raw_id = time::new_id();
    let checksum = audit::sha256_hex(payload);
    let length = payload.len() as i64;
    let created_at = store.now();

    audit::audited_write(store, "intake", |tx| {
        tx.execute(
            "INSERT INTO raw_records(id, room_id, created_at, payload, mime_type, length, checksum, processed)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![raw_id, room_id, created_at, payload, mime_type, length, checksum],
        )?;
        let ev = AppendRequest::system(
            LifecycleEvent::RawIngested {
                raw_id: raw_id.clone(),
                mime_type: mime_type.to_string(),
                length,
                checksum: checksum.clone(),
            },
            "intake",
        )
        .in_room(room_id);
        Ok(((), vec![ev]))
    })?;

    tracing::info!(raw_id = %raw_id, room_id, length, "raw payload ingested");
    Ok(raw_id)
}

pub fn load_raw(store: &Store, raw_id: &str) -> Result<RawRecord, ColdchainError> {
    store.broker().with_read("intake.load", |conn| {
        conn.query_row(
            "SELECT id, room_id, created_at, payload, mime_type, length, checksum, processed
             FROM raw_records WHERE id = ?1",
            [raw_id],
            |row| {
                Ok(RawRecord {
                    id: row.get(0)?,
                    room_id: row.get(1)?,
                    created_at: row.get(2)?,
                    payload: row.get(3)?,
                    mime_type: row.get(4)?,
                    length: row.get(5)?,
                    checksum: row.get(6)?,
                    processed: row.get(7)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| ColdchainError::NotFound(format!("raw record {}", raw_id)))
    })
}

#[derive(Parser, Debug)]
#[clap(name = "intake", about = "Accept raw payloads into the pipeline.")]
pub struct IntakeCli {
    #[clap(subcommand)]
    pub command: IntakeCommand,
}

#[derive(Subcommand, Debug)]
pub enum IntakeCommand {
    /// Store a payload read from a file (or given inline with --text).
    Add {
        #[clap(long)]
        room: String,
        #[clap(long, default_value = "application/octet-stream")]
        mime: String,
        #[clap(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        #[clap(long)]
        text: Option<String>,
        /// Also enqueue an encode job for the new record.
        #[clap(long)]
        enqueue: bool,
    },
    /// Show raw record metadata.
    Show {
        #[clap(long)]
        id: String,
    },
}

pub fn run_intake_cli(store: &Store, cli: IntakeCli) -> Result<serde_json::Value, ColdchainError> {
    match cli.command {
        IntakeCommand::Add {
            room,
            mime,
            file,
            text,
            enqueue,
        } => {
            let payload = match (file, text) {
                (Some(path), _) => fs::read(&path).map_err(ColdchainError::Io)?,
                (None, Some(text)) => text.into_bytes(),
                (None, None) => {
                    return Err(ColdchainError::Validation(
                        "one of --file or --text is required".to_string(),
                    ));
                }
            };
            let raw_id = intake(store, &room, &payload, &mime)?;
            let job_id = if enqueue {
                Some(crate::plugins::queue::enqueue(store, &raw_id)?)
            } else {
                None
            };
            Ok(time::command_envelope(
                "intake.add",
                "ok",
                serde_json::json!({ "raw_id": raw_id, "job_id": job_id }),
            ))
        }
        IntakeCommand::Show { id } => {
            let raw = load_raw(store, &id)?;
            Ok(time::command_envelope(
                "intake.show",
                "ok",
                serde_json::json!({ "raw": raw }),
            ))
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "intake",
        "version": "0.1.0",
        "description": "Raw payload intake with SHA-256 checksums",
        "commands": [
            { "name": "add", "parameters": ["room", "mime", "file", "text", "enqueue"] },
            { "name": "show", "parameters": ["id"] }
        ],
        "storage": ["coldchain.db:raw_records"]
    })
}
