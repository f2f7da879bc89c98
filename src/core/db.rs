use crate::core::error::ColdchainError;
use crate::core::schemas;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn db_connect(db_path: &str, busy_timeout: Duration) -> Result<Connection, ColdchainError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(schemas::DB_NAME)
}

/// Create every table, index and trigger plus the default overflow partition.
/// Safe to run on every open.
pub fn ensure_schema(conn: &Connection, now: i64) -> Result<(), ColdchainError> {
    for ddl in schemas::all_schemas() {
        conn.execute_batch(ddl)?;
    }
    let default_table = format!(
        "{}_{}",
        schemas::COMPRESSED_TABLE_PREFIX,
        schemas::DEFAULT_PARTITION_KEY
    );
    conn.execute_batch(&schemas::compressed_table_ddl(&default_table, None))?;
    conn.execute(
        "INSERT OR IGNORE INTO compressed_partitions(partition_key, table_name, range_start, range_end, created_at)
         VALUES(?1, ?2, NULL, NULL, ?3)",
        params![schemas::DEFAULT_PARTITION_KEY, default_table, now],
    )?;
    Ok(())
}

pub fn initialize_db(root: &Path, now: i64) -> Result<PathBuf, ColdchainError> {
    fs::create_dir_all(root).map_err(ColdchainError::Io)?;
    let path = db_path(root);
    let conn = db_connect(&path.to_string_lossy(), Duration::from_secs(5))?;
    ensure_schema(&conn, now)?;
    tracing::debug!(db = %path.display(), "schema ensured");
    Ok(path)
}
