//! Centralized database schema definitions.
//!
//! Everything lives in one SQLite file, `coldchain.db`:
//! 1. Intake and queue: `raw_records`, `encode_jobs`.
//! 2. Compressed store: `compressed_partitions` registry, one physical table
//!    per month partition plus the default overflow table, and
//!    `compressed_locator` mapping record ids to their partition table.
//! 3. Retention: `room_retention`, `retention_schedule`, `legal_holds`.
//! 4. Audit: `audit_events` (append-only, enforced by triggers).

pub const DB_NAME: &str = "coldchain.db";

pub const RAW_RECORDS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS raw_records (
        id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        payload BLOB NOT NULL,
        mime_type TEXT NOT NULL,
        length INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0 CHECK (processed IN (0, 1))
    );
    CREATE INDEX IF NOT EXISTS idx_raw_records_room ON raw_records(room_id, created_at);
";

pub const ENCODE_JOBS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS encode_jobs (
        id TEXT PRIMARY KEY,
        raw_id TEXT NOT NULL REFERENCES raw_records(id),
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'done', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        last_attempt_at INTEGER,
        error TEXT,
        compressed_id TEXT,
        lease_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_encode_jobs_claim ON encode_jobs(status, created_at);
";

pub const DEFAULT_PARTITION_KEY: &str = "default";
pub const COMPRESSED_TABLE_PREFIX: &str = "logs_compressed";
/// Resource type used by retention entries and holds for compressed records.
pub const COMPRESSED_RESOURCE: &str = "logs_compressed";
pub const ROOM_RESOURCE: &str = "room";

pub const PARTITION_REGISTRY_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS compressed_partitions (
        partition_key TEXT PRIMARY KEY,
        table_name TEXT NOT NULL UNIQUE,
        range_start INTEGER,
        range_end INTEGER,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS compressed_locator (
        id TEXT PRIMARY KEY,
        raw_id TEXT NOT NULL UNIQUE,
        partition_key TEXT NOT NULL,
        table_name TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_compressed_locator_partition ON compressed_locator(partition_key);
";

/// Column list shared by every partition table, in insert order.
pub const COMPRESSED_COLUMNS: &str = "id, raw_id, room_id, partition_key, created_at, codec, \
     compressed_bytes, original_length, checksum, cold_storage_uri, lifecycle_state, purged, updated_at";

/// DDL for one partition table. `bounds` adds a range CHECK for month partitions.
pub fn compressed_table_ddl(table: &str, bounds: Option<(i64, i64)>) -> String {
    let range_check = match bounds {
        Some((start, end)) => format!(
            ",\n        CHECK (created_at >= {} AND created_at < {})",
            start, end
        ),
        None => String::new(),
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
        id TEXT PRIMARY KEY,
        raw_id TEXT NOT NULL UNIQUE,
        room_id TEXT NOT NULL,
        partition_key TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        codec TEXT NOT NULL,
        compressed_bytes BLOB NOT NULL,
        original_length INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        cold_storage_uri TEXT,
        lifecycle_state TEXT NOT NULL DEFAULT 'hot'
            CHECK (lifecycle_state IN ('hot', 'cold', 'deleted')),
        purged INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL{range_check}
    );
    CREATE INDEX IF NOT EXISTS idx_{table}_lifecycle ON {table}(lifecycle_state, created_at);"
    )
}

pub const RETENTION_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS room_retention (
        room_id TEXT PRIMARY KEY,
        retention_hot_days INTEGER CHECK (retention_hot_days IS NULL OR retention_hot_days > 0),
        retention_cold_days INTEGER CHECK (retention_cold_days IS NULL OR retention_cold_days > 0),
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS retention_schedule (
        id TEXT PRIMARY KEY,
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        room_id TEXT,
        scheduled_for INTEGER NOT NULL,
        action TEXT NOT NULL CHECK (action IN ('move_to_cold', 'delete')),
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'done', 'failed', 'on_hold')),
        on_hold INTEGER NOT NULL DEFAULT 0,
        hold_reason TEXT,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS uq_retention_schedule_active
        ON retention_schedule(resource_type, resource_id, action) WHERE status != 'done';
    CREATE INDEX IF NOT EXISTS idx_retention_schedule_due ON retention_schedule(status, scheduled_for);
    CREATE INDEX IF NOT EXISTS idx_retention_schedule_room ON retention_schedule(room_id);
";

pub const LEGAL_HOLDS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS legal_holds (
        id TEXT PRIMARY KEY,
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        hold_until INTEGER NOT NULL,
        reason TEXT NOT NULL,
        actor TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (resource_type, resource_id)
    );
";

pub const AUDIT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS audit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        event_time INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        room_id TEXT,
        user_id TEXT,
        message_id TEXT,
        payload TEXT NOT NULL,
        actor TEXT NOT NULL,
        signature TEXT,
        event_hash TEXT NOT NULL,
        prev_chain_hash TEXT NOT NULL,
        chain_hash TEXT NOT NULL,
        UNIQUE (node_id, seq)
    );
    CREATE TRIGGER IF NOT EXISTS audit_events_no_update
        BEFORE UPDATE ON audit_events
        BEGIN SELECT RAISE(ABORT, 'audit_events is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
        BEFORE DELETE ON audit_events
        BEGIN SELECT RAISE(ABORT, 'audit_events is append-only'); END;
";

pub fn all_schemas() -> [&'static str; 6] {
    [
        RAW_RECORDS_SCHEMA,
        ENCODE_JOBS_SCHEMA,
        PARTITION_REGISTRY_SCHEMA,
        RETENTION_SCHEMA,
        LEGAL_HOLDS_SCHEMA,
        AUDIT_SCHEMA,
    ]
}
