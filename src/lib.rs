//! Coldchain: ingest → compress → store → retain/purge → audit.
//!
//! Raw message payloads enter through [`plugins::intake`], wait in the
//! durable encode queue ([`plugins::queue`]) for an external codec, land in a
//! monthly-partitioned compressed store ([`plugins::compress`],
//! [`plugins::partitions`]) and age hot → cold → deleted under the retention
//! scheduler ([`plugins::retention`]) unless a legal hold
//! ([`plugins::holds`]) excludes them. Every lifecycle transition is appended
//! to a per-node, hash-chained audit trail ([`plugins::audit`]) in the same
//! transaction as the change it records.
//!
//! # Storage
//!
//! One SQLite file, `coldchain.db`, under a store root. All access goes
//! through the [`core::broker::DbBroker`]: writes are serialized per database
//! and run in `BEGIN IMMEDIATE` transactions, reads use fresh connections.
//!
//! # Example
//!
//! ```no_run
//! use coldchain::core::store::Store;
//! use coldchain::plugins::{compress, intake, queue};
//!
//! # fn main() -> Result<(), coldchain::core::error::ColdchainError> {
//! let store = Store::open(std::path::Path::new(".coldchain"))?;
//! let raw_id = intake::intake(&store, "room-a", b"hello", "text/plain")?;
//! let job_id = queue::enqueue(&store, &raw_id)?;
//! for job in queue::claim_batch(&store, 10)? {
//!     let compressed_id = compress::encode_raw_to_compressed(&store, &job.raw_id, "lz4", b"..")?;
//!     queue::mark_done(&store, &job.job_id, &job.lease_id, &compressed_id)?;
//! }
//! # let _ = job_id;
//! # Ok(())
//! # }
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store handle, broker, schemas, config, clock, logging, errors
//! - [`plugins`]: pipeline components and their CLI groups

pub mod core;
pub mod plugins;

use crate::core::{config, db, error::ColdchainError, logging, store::Store, time};
use crate::plugins::{audit, compress, holds, intake, partitions, queue, retention};

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

pub const ROOT_ENV: &str = "COLDCHAIN_ROOT";
const DEFAULT_ROOT: &str = ".coldchain";

#[derive(Parser, Debug)]
#[clap(
    name = "coldchain",
    version = env!("CARGO_PKG_VERSION"),
    about = "Payload retention pipeline with a hash-chained audit trail"
)]
struct Cli {
    /// Store root (defaults to $COLDCHAIN_ROOT, then ./.coldchain).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct SchemaCli {
    /// Optional: filter by subsystem name
    #[clap(long)]
    subsystem: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the store root, database and default config
    #[clap(name = "init")]
    Init,

    /// Accept raw payloads
    #[clap(name = "intake")]
    Intake(intake::IntakeCli),

    /// Encode job queue
    #[clap(name = "queue", visible_alias = "q")]
    Queue(queue::QueueCli),

    /// Compressed records
    #[clap(name = "compress")]
    Compress(compress::CompressCli),

    /// Monthly partitions
    #[clap(name = "partition")]
    Partition(partitions::PartitionCli),

    /// Retention scheduling and overrides
    #[clap(name = "retention")]
    Retention(retention::RetentionCli),

    /// Legal holds
    #[clap(name = "hold")]
    Hold(holds::HoldCli),

    /// Hash-chained audit trail
    #[clap(name = "audit")]
    Audit(audit::AuditCli),

    /// Subsystem schemas and discovery
    #[clap(name = "schema")]
    Schema(SchemaCli),
}

fn resolve_root(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        std::env::var(ROOT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT))
}

/// Every subsystem schema keyed by name.
pub fn schemas() -> std::collections::BTreeMap<&'static str, serde_json::Value> {
    let mut schemas = std::collections::BTreeMap::new();
    schemas.insert("intake", intake::schema());
    schemas.insert("queue", queue::schema());
    schemas.insert("compress", compress::schema());
    schemas.insert("partition", partitions::schema());
    schemas.insert("retention", retention::schema());
    schemas.insert("hold", holds::schema());
    schemas.insert("audit", audit::schema());
    schemas
}

/// Envelope printed for a failed command.
pub fn error_envelope(err: &ColdchainError) -> serde_json::Value {
    time::command_envelope(
        "error",
        "error",
        serde_json::json!({
            "error": { "code": err.code(), "message": err.to_string() }
        }),
    )
}

fn schema_output(schema_cli: &SchemaCli) -> Result<serde_json::Value, ColdchainError> {
    let schemas = schemas();
    match &schema_cli.subsystem {
        Some(sub) => schemas
            .get(sub.as_str())
            .cloned()
            .ok_or_else(|| ColdchainError::NotFound(format!("subsystem '{}'", sub))),
        None => Ok(serde_json::json!({
            "schema_version": "1.0.0",
            "subsystems": schemas
        })),
    }
}

/// Parse the command line, run one command and return its JSON envelope.
pub fn run() -> Result<serde_json::Value, ColdchainError> {
    let cli = Cli::parse();
    if let Command::Schema(schema_cli) = &cli.command {
        return schema_output(schema_cli);
    }

    let root = resolve_root(cli.root);
    fs::create_dir_all(&root).map_err(ColdchainError::Io)?;
    let store = Store::open(&root)?;
    logging::init_logging(&store.config.log)?;
    tracing::debug!(root = %root.display(), node_id = store.node_id(), "store opened");

    match cli.command {
        Command::Init => {
            let wrote_config = config::write_default_config(&root)?;
            Ok(time::command_envelope(
                "init",
                "ok",
                serde_json::json!({
                    "root": root,
                    "db": db::db_path(&root),
                    "config_written": wrote_config,
                }),
            ))
        }
        Command::Intake(cli) => intake::run_intake_cli(&store, cli),
        Command::Queue(cli) => queue::run_queue_cli(&store, cli),
        Command::Compress(cli) => compress::run_compress_cli(&store, cli),
        Command::Partition(cli) => partitions::run_partition_cli(&store, cli),
        Command::Retention(cli) => retention::run_retention_cli(&store, cli),
        Command::Hold(cli) => holds::run_hold_cli(&store, cli),
        Command::Audit(cli) => audit::run_audit_cli(&store, cli),
        Command::Schema(schema_cli) => schema_output(&schema_cli),
    }
}
