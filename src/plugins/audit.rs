//! Append-only, hash-chained audit trail.
//!
//! Each node keeps an independent chain:
//! `chain_hash[i] = SHA-256(chain_hash[i-1] || event_hash[i])`, starting from
//! the literal `"genesis"`. `event_hash` is the SHA-256 of the canonical JSON
//! form of the event (sorted keys, no whitespace, timestamp included).
//!
//! Chain extension for a node is serialized by a named lock keyed on the node
//! id. The public [`audit_append`] never waits for that lock: if another
//! writer holds it, the call fails with `LockContention` and the caller
//! retries. Pipeline stages go through [`audited_write`], which retries with
//! bounded backoff and writes the events in the same transaction as the state
//! change they describe.

use crate::core::broker::retry_with_backoff;
use crate::core::error::ColdchainError;
use crate::core::locks::{self, NamedLockGuard};
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const GENESIS: &str = "genesis";
pub const PAYLOAD_VERSION: u32 = 1;

/// Lifecycle events emitted by the pipeline itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event_type", content = "data")]
pub enum LifecycleEvent {
    #[serde(rename = "raw.ingested")]
    RawIngested {
        raw_id: String,
        mime_type: String,
        length: i64,
        checksum: String,
    },
    #[serde(rename = "record.compressed")]
    RecordCompressed {
        raw_id: String,
        compressed_id: String,
        partition_key: String,
        codec: String,
        original_length: i64,
        compressed_length: i64,
    },
    #[serde(rename = "job.completed")]
    JobCompleted {
        job_id: String,
        raw_id: String,
        compressed_id: String,
    },
    #[serde(rename = "job.failed")]
    JobFailed {
        job_id: String,
        raw_id: String,
        attempts: i64,
        error: String,
    },
    #[serde(rename = "record.cold")]
    RecordCold { compressed_id: String, uri: String },
    #[serde(rename = "record.disposed")]
    RecordDisposed { compressed_id: String, purged: bool },
    #[serde(rename = "retention.scheduled")]
    RetentionScheduled {
        hot_scheduled: u64,
        cold_scheduled: u64,
    },
    #[serde(rename = "hold.applied")]
    HoldApplied {
        resource_type: String,
        resource_id: String,
        hold_until: i64,
        reason: String,
    },
    #[serde(rename = "hold.released")]
    HoldReleased {
        resource_type: String,
        resource_id: String,
    },
    #[serde(rename = "partition.created")]
    PartitionCreated {
        partition_key: String,
        table_name: String,
        moved_rows: u64,
    },
    #[serde(rename = "partition.dropped")]
    PartitionDropped { partition_key: String, rows: u64 },
}

impl LifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::RawIngested { .. } => "raw.ingested",
            LifecycleEvent::RecordCompressed { .. } => "record.compressed",
            LifecycleEvent::JobCompleted { .. } => "job.completed",
            LifecycleEvent::JobFailed { .. } => "job.failed",
            LifecycleEvent::RecordCold { .. } => "record.cold",
            LifecycleEvent::RecordDisposed { .. } => "record.disposed",
            LifecycleEvent::RetentionScheduled { .. } => "retention.scheduled",
            LifecycleEvent::HoldApplied { .. } => "hold.applied",
            LifecycleEvent::HoldReleased { .. } => "hold.released",
            LifecycleEvent::PartitionCreated { .. } => "partition.created",
            LifecycleEvent::PartitionDropped { .. } => "partition.dropped",
        }
    }
}

/// Versioned event payload. Producers outside the pipeline use `Custom`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditPayload {
    Lifecycle(LifecycleEvent),
    Custom { event_type: String, data: JsonValue },
}

impl AuditPayload {
    /// Interpret an `(event_type, data)` pair, preferring the typed form when
    /// it represents `data` losslessly.
    pub fn from_parts(event_type: &str, data: JsonValue) -> Self {
        let tagged = serde_json::json!({ "event_type": event_type, "data": data });
        match serde_json::from_value::<LifecycleEvent>(tagged) {
            Ok(ev)
                if serde_json::to_value(&ev)
                    .ok()
                    .and_then(|v| v.get("data").cloned())
                    .as_ref()
                    == Some(&data) =>
            {
                AuditPayload::Lifecycle(ev)
            }
            _ => AuditPayload::Custom {
                event_type: event_type.to_string(),
                data,
            },
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            AuditPayload::Lifecycle(ev) => ev.event_type(),
            AuditPayload::Custom { event_type, .. } => event_type,
        }
    }

    /// `{"v": 1, "event_type": ..., "data": ...}` as stored in the payload column.
    pub fn envelope(&self) -> Result<JsonValue, ColdchainError> {
        let mut value = match self {
            AuditPayload::Lifecycle(ev) => serde_json::to_value(ev)?,
            AuditPayload::Custom { event_type, data } => {
                serde_json::json!({ "event_type": event_type, "data": data })
            }
        };
        if let Some(obj) = value.as_object_mut() {
            obj.insert("v".to_string(), JsonValue::from(PAYLOAD_VERSION));
        }
        Ok(value)
    }

    pub fn from_envelope(envelope: &JsonValue) -> Self {
        let event_type = envelope
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let data = envelope.get("data").cloned().unwrap_or(JsonValue::Null);
        Self::from_parts(event_type, data)
    }
}

impl From<LifecycleEvent> for AuditPayload {
    fn from(ev: LifecycleEvent) -> Self {
        AuditPayload::Lifecycle(ev)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub payload: AuditPayload,
    pub room_id: Option<String>,
    pub user_id: Option<String>,
    pub message_id: Option<String>,
    pub actor: String,
    pub signature: Option<String>,
}

impl AppendRequest {
    /// A pipeline-originated event attributed to `actor`.
    pub fn system(ev: LifecycleEvent, actor: &str) -> Self {
        Self {
            payload: ev.into(),
            room_id: None,
            user_id: None,
            message_id: None,
            actor: actor.to_string(),
            signature: None,
        }
    }

    pub fn in_room(mut self, room_id: &str) -> Self {
        self.room_id = Some(room_id.to_string());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub id: i64,
    pub node_id: String,
    pub seq: i64,
    pub event_time: i64,
    pub event_type: String,
    pub room_id: Option<String>,
    pub user_id: Option<String>,
    pub message_id: Option<String>,
    pub payload: JsonValue,
    pub actor: String,
    pub signature: Option<String>,
    pub event_hash: String,
    pub prev_chain_hash: String,
    pub chain_hash: String,
}

impl AuditEvent {
    pub fn typed_payload(&self) -> AuditPayload {
        AuditPayload::from_envelope(&self.payload)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub node_id: String,
    pub seq: i64,
    pub chain_hash: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub node_id: String,
    pub events: u64,
    pub valid: bool,
    pub head: String,
    pub first_broken_id: Option<i64>,
    pub reason: Option<String>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compact JSON with object keys sorted lexicographically at every depth.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

struct HashInput<'a> {
    node_id: &'a str,
    event_time: i64,
    event_type: &'a str,
    room_id: Option<&'a str>,
    user_id: Option<&'a str>,
    message_id: Option<&'a str>,
    payload: &'a JsonValue,
    actor: &'a str,
    signature: Option<&'a str>,
}

fn event_hash(input: &HashInput<'_>) -> String {
    let canonical = canonical_json(&serde_json::json!({
        "node_id": input.node_id,
        "event_time": input.event_time,
        "event_type": input.event_type,
        "room_id": input.room_id,
        "user_id": input.user_id,
        "message_id": input.message_id,
        "payload": input.payload,
        "actor": input.actor,
        "signature": input.signature,
    }));
    sha256_hex(canonical.as_bytes())
}

pub fn link_hash(prev_chain_hash: &str, event_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_chain_hash.as_bytes());
    hasher.update(event_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fold event hashes into chain hashes starting from `prev`.
pub fn chain_hashes(prev: &str, event_hashes: &[String]) -> Vec<String> {
    let mut current = prev.to_string();
    event_hashes
        .iter()
        .map(|h| {
            current = link_hash(&current, h);
            current.clone()
        })
        .collect()
}

/// Recompute the event hash from the stored fields of `ev`.
pub fn recompute_event_hash(ev: &AuditEvent) -> String {
    event_hash(&HashInput {
        node_id: &ev.node_id,
        event_time: ev.event_time,
        event_type: &ev.event_type,
        room_id: ev.room_id.as_deref(),
        user_id: ev.user_id.as_deref(),
        message_id: ev.message_id.as_deref(),
        payload: &ev.payload,
        actor: &ev.actor,
        signature: ev.signature.as_deref(),
    })
}

fn acquire_chain_lock(store: &Store, node_id: &str) -> Result<NamedLockGuard, ColdchainError> {
    locks::try_acquire(store.broker().db_path(), node_id).ok_or_else(|| {
        tracing::warn!(node_id, "audit chain lock busy");
        ColdchainError::LockContention {
            node_id: node_id.to_string(),
        }
    })
}

fn read_head(conn: &Connection, node_id: &str) -> Result<(i64, String), ColdchainError> {
    let head: Option<(i64, String)> = conn
        .query_row(
            "SELECT seq, chain_hash FROM audit_events WHERE node_id = ?1 ORDER BY seq DESC LIMIT 1",
            [node_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(head.unwrap_or((0, GENESIS.to_string())))
}

/// Extend the chain for `node_id` inside an open transaction. The caller must
/// hold the node's chain lock.
fn append_in_tx(
    tx: &Transaction<'_>,
    node_id: &str,
    now: i64,
    req: &AppendRequest,
) -> Result<i64, ColdchainError> {
    let (head_seq, prev_chain_hash) = read_head(tx, node_id)?;
    let payload = req.payload.envelope()?;
    let event_type = req.payload.event_type();
    let hash = event_hash(&HashInput {
        node_id,
        event_time: now,
        event_type,
        room_id: req.room_id.as_deref(),
        user_id: req.user_id.as_deref(),
        message_id: req.message_id.as_deref(),
        payload: &payload,
        actor: &req.actor,
        signature: req.signature.as_deref(),
    });
    let chain_hash = link_hash(&prev_chain_hash, &hash);

    tx.execute(
        "INSERT INTO audit_events(node_id, seq, event_time, event_type, room_id, user_id, message_id,
                                  payload, actor, signature, event_hash, prev_chain_hash, chain_hash)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            node_id,
            head_seq + 1,
            now,
            event_type,
            req.room_id,
            req.user_id,
            req.message_id,
            canonical_json(&payload),
            req.actor,
            req.signature,
            hash,
            prev_chain_hash,
            chain_hash
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Append one event to this store's node chain. Fails fast with
/// `LockContention` if another writer is extending the same chain.
pub fn audit_append(store: &Store, req: &AppendRequest) -> Result<i64, ColdchainError> {
    let node_id = store.node_id().to_string();
    let _guard = acquire_chain_lock(store, &node_id)?;
    let now = store.now();
    let id = store
        .broker()
        .with_write("audit.append", |tx| append_in_tx(tx, &node_id, now, req))?;
    tracing::debug!(node_id = %node_id, event_id = id, event_type = req.payload.event_type(), "audit event appended");
    Ok(id)
}

/// Run a state change and append the audit events it returns in the same
/// transaction. Chain-lock contention is retried with bounded backoff.
pub fn audited_write<F, R>(store: &Store, op: &str, mut f: F) -> Result<R, ColdchainError>
where
    F: FnMut(&Transaction<'_>) -> Result<(R, Vec<AppendRequest>), ColdchainError>,
{
    let node_id = store.node_id().to_string();
    retry_with_backoff(store.config.audit.lock_retries, || {
        let _guard = acquire_chain_lock(store, &node_id)?;
        let now = store.now();
        store.broker().with_write(op, |tx| {
            let (value, events) = f(tx)?;
            for ev in &events {
                append_in_tx(tx, &node_id, now, ev)?;
            }
            Ok(value)
        })
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let payload_text: String = row.get(8)?;
    let payload = serde_json::from_str(&payload_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(AuditEvent {
        id: row.get(0)?,
        node_id: row.get(1)?,
        seq: row.get(2)?,
        event_time: row.get(3)?,
        event_type: row.get(4)?,
        room_id: row.get(5)?,
        user_id: row.get(6)?,
        message_id: row.get(7)?,
        payload,
        actor: row.get(9)?,
        signature: row.get(10)?,
        event_hash: row.get(11)?,
        prev_chain_hash: row.get(12)?,
        chain_hash: row.get(13)?,
    })
}

const EVENT_COLUMNS: &str = "id, node_id, seq, event_time, event_type, room_id, user_id, message_id, \
     payload, actor, signature, event_hash, prev_chain_hash, chain_hash";

fn load_chain(conn: &Connection, node_id: &str) -> Result<Vec<AuditEvent>, ColdchainError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM audit_events WHERE node_id = ?1 ORDER BY seq ASC",
        EVENT_COLUMNS
    ))?;
    let rows = stmt.query_map([node_id], row_to_event)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// The most recent `limit` events for a node, oldest first.
pub fn list_events(
    store: &Store,
    node_id: &str,
    limit: usize,
) -> Result<Vec<AuditEvent>, ColdchainError> {
    store.broker().with_read("audit.list", |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_events WHERE node_id = ?1 ORDER BY seq DESC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![node_id, limit as i64], row_to_event)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        out.reverse();
        Ok(out)
    })
}

pub fn chain_head(store: &Store, node_id: &str) -> Result<ChainHead, ColdchainError> {
    store.broker().with_read("audit.head", |conn| {
        let (seq, chain_hash) = read_head(conn, node_id)?;
        Ok(ChainHead {
            node_id: node_id.to_string(),
            seq,
            chain_hash,
        })
    })
}

/// Check every stored event of a node against its recomputed hashes and links.
pub fn verify_events(node_id: &str, events: &[AuditEvent]) -> ChainReport {
    let mut prev = GENESIS.to_string();
    for (i, ev) in events.iter().enumerate() {
        let broken = if ev.seq != i as i64 + 1 {
            Some(format!("sequence gap: expected {}, found {}", i + 1, ev.seq))
        } else if recompute_event_hash(ev) != ev.event_hash {
            Some("event_hash does not match event contents".to_string())
        } else if ev.prev_chain_hash != prev {
            Some("prev_chain_hash does not link to predecessor".to_string())
        } else if link_hash(&prev, &ev.event_hash) != ev.chain_hash {
            Some("chain_hash mismatch".to_string())
        } else {
            None
        };
        if let Some(reason) = broken {
            return ChainReport {
                node_id: node_id.to_string(),
                events: events.len() as u64,
                valid: false,
                head: prev,
                first_broken_id: Some(ev.id),
                reason: Some(reason),
            };
        }
        prev = ev.chain_hash.clone();
    }
    ChainReport {
        node_id: node_id.to_string(),
        events: events.len() as u64,
        valid: true,
        head: prev,
        first_broken_id: None,
        reason: None,
    }
}

pub fn verify_chain(store: &Store, node_id: &str) -> Result<ChainReport, ColdchainError> {
    let events = store
        .broker()
        .with_read("audit.verify", |conn| load_chain(conn, node_id))?;
    let report = verify_events(node_id, &events);
    if !report.valid {
        tracing::error!(
            node_id,
            event_id = report.first_broken_id,
            reason = report.reason.as_deref().unwrap_or_default(),
            "audit chain verification failed"
        );
    }
    Ok(report)
}

#[derive(Parser, Debug)]
#[clap(name = "audit", about = "Append to and verify the hash-chained audit trail.")]
pub struct AuditCli {
    #[clap(subcommand)]
    pub command: AuditCommand,
}

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Append an event to this node's chain (fails fast on contention).
    Append {
        #[clap(long)]
        event_type: String,
        /// JSON payload body.
        #[clap(long, default_value = "{}")]
        payload: String,
        #[clap(long)]
        room: Option<String>,
        #[clap(long)]
        user: Option<String>,
        #[clap(long)]
        message: Option<String>,
        #[clap(long, default_value = "coldchain")]
        actor: String,
        #[clap(long)]
        signature: Option<String>,
    },
    /// Recompute and check a node's chain.
    Verify {
        #[clap(long)]
        node: Option<String>,
    },
    /// Show the latest chain hash for a node.
    Head {
        #[clap(long)]
        node: Option<String>,
    },
    /// Show the most recent events for a node.
    Tail {
        #[clap(long)]
        node: Option<String>,
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
}

pub fn run_audit_cli(store: &Store, cli: AuditCli) -> Result<JsonValue, ColdchainError> {
    let default_node = store.node_id().to_string();
    match cli.command {
        AuditCommand::Append {
            event_type,
            payload,
            room,
            user,
            message,
            actor,
            signature,
        } => {
            let data: JsonValue = serde_json::from_str(&payload)
                .map_err(|e| ColdchainError::Validation(format!("payload is not JSON: {}", e)))?;
            let req = AppendRequest {
                payload: AuditPayload::from_parts(&event_type, data),
                room_id: room,
                user_id: user,
                message_id: message,
                actor,
                signature,
            };
            let id = audit_append(store, &req)?;
            Ok(time::command_envelope(
                "audit.append",
                "ok",
                serde_json::json!({ "node_id": default_node, "audit_event_id": id }),
            ))
        }
        AuditCommand::Verify { node } => {
            let node = node.unwrap_or(default_node);
            let report = verify_chain(store, &node)?;
            let status = if report.valid { "ok" } else { "broken" };
            Ok(time::command_envelope(
                "audit.verify",
                status,
                serde_json::json!({ "report": report }),
            ))
        }
        AuditCommand::Head { node } => {
            let head = chain_head(store, &node.unwrap_or(default_node))?;
            Ok(time::command_envelope(
                "audit.head",
                "ok",
                serde_json::json!({ "head": head }),
            ))
        }
        AuditCommand::Tail { node, limit } => {
            let events = list_events(store, &node.unwrap_or(default_node), limit)?;
            Ok(time::command_envelope(
                "audit.tail",
                "ok",
                serde_json::json!({ "events": events }),
            ))
        }
    }
}

pub fn schema() -> JsonValue {
    serde_json::json!({
        "name": "audit",
        "version": "0.1.0",
        "description": "Hash-chained, append-only audit trail per node",
        "commands": [
            { "name": "append", "parameters": ["event_type", "payload", "room", "user", "message", "actor", "signature"] },
            { "name": "verify", "parameters": ["node"] },
            { "name": "head", "parameters": ["node"] },
            { "name": "tail", "parameters": ["node", "limit"] }
        ],
        "storage": ["coldchain.db:audit_events"]
    })
}
