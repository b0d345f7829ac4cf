pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Open (or create) the archive database at the given path, with WAL enabled
/// and schema initialized.
///
/// Returns the connection and whether the FTS5 index is available.
pub fn open_database(
    path: impl AsRef<Path>,
    enable_fts: bool,
    busy_timeout_ms: u64,
) -> Result<(Connection, bool)> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // Wait for other writers instead of failing fast; set first so the WAL
    // switch below also honours it.
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // NORMAL is durable across application crashes in WAL mode; fsync happens
    // at checkpoint time, which maintenance drives.
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    // Checkpoints are driven by maintenance; the auto threshold is only a
    // backstop for deployments that run without the daemon.
    conn.pragma_update(None, "wal_autocheckpoint", 10_000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let fts = schema::init_schema(&conn, enable_fts).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    tracing::debug!(path = %path.display(), fts, "database opened");
    Ok((conn, fts))
}

/// Open an in-memory database for testing.
pub fn open_memory_database() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn, true).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    Ok(conn)
}

/// Read a key from `maintenance_meta`.
pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM maintenance_meta WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

/// Upsert a key in `maintenance_meta`.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO maintenance_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Paths of the `-wal` and `-shm` sidecars for a database file.
pub fn sidecar_paths(db_path: &Path) -> (PathBuf, PathBuf) {
    let mut wal = db_path.as_os_str().to_owned();
    wal.push("-wal");
    let mut shm = db_path.as_os_str().to_owned();
    shm.push("-shm");
    (PathBuf::from(wal), PathBuf::from(shm))
}

/// Size of a file in bytes, zero if it does not exist.
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Result of [`check_database_health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub fts_enabled: bool,
    pub archive_count: u64,
    pub embedding_count: u64,
    /// Archives with no chunk rows at all.
    pub unembedded_count: u64,
    pub log_count: u64,
}

/// Run `quick_check` and gather row counts.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA quick_check")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    let integrity_ok = integrity.len() == 1 && integrity[0] == "ok";

    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    Ok(HealthReport {
        integrity_ok,
        integrity_details: integrity.join("; "),
        schema_version: migrations::get_schema_version(conn)?,
        embedding_model: migrations::get_embedding_model(conn)?,
        fts_enabled: schema::fts_available(conn),
        archive_count: count("SELECT COUNT(*) FROM archives")?,
        embedding_count: count("SELECT COUNT(*) FROM embeddings")?,
        unembedded_count: count(
            "SELECT COUNT(*) FROM archives a \
             WHERE NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.task_id = a.task_id)",
        )?,
        log_count: count("SELECT COUNT(*) FROM maintenance_log")?,
    })
}
