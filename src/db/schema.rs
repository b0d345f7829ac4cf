//! SQL DDL for all archivist tables.
//!
//! Defines `archives`, `embeddings`, `maintenance_log`, `maintenance_meta`,
//! `schema_meta`, and the optional `archives_fts` (FTS5) index. All DDL uses
//! `IF NOT EXISTS`, so several processes may initialize the same file.

use rusqlite::Connection;

/// Core schema, always created.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS archives (
    task_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    filepath TEXT UNIQUE,
    content_hash TEXT NOT NULL UNIQUE,
    content TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'archive'
        CHECK(kind IN ('archive','reflection','doc','rule','code')),
    status TEXT
        CHECK(status IS NULL OR status IN ('pending','in_progress','done','deferred','cancelled','blocked')),
    completed_at TEXT,
    summary TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    embedding_version INTEGER NOT NULL DEFAULT 1,
    last_embedded_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_archives_kind ON archives(kind);
CREATE INDEX IF NOT EXISTS idx_archives_status ON archives(status);
CREATE INDEX IF NOT EXISTS idx_archives_completed ON archives(completed_at);
CREATE INDEX IF NOT EXISTS idx_archives_embedded ON archives(last_embedded_at);

-- Vector chunks: little-endian f32 blobs, regenerated wholesale on content change
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL REFERENCES archives(task_id) ON DELETE CASCADE,
    chunk_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    vector BLOB NOT NULL,
    UNIQUE(task_id, chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_task ON embeddings(task_id);

-- Append-only audit of maintenance runs
CREATE TABLE IF NOT EXISTS maintenance_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('checkpoint','vacuum','health_check','reembed')),
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_seconds REAL,
    success INTEGER NOT NULL,
    details TEXT,
    error_message TEXT,
    db_size_before_mb REAL,
    db_size_after_mb REAL,
    space_saved_bytes INTEGER
);

CREATE INDEX IF NOT EXISTS idx_maintenance_log_op ON maintenance_log(operation, started_at);

-- Last-run timestamps survive restarts
CREATE TABLE IF NOT EXISTS maintenance_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Standalone FTS5 index; `task_id` is carried but not tokenized.
const FTS_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS archives_fts USING fts5(
    task_id UNINDEXED,
    title,
    content
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
///
/// Returns whether the lexical index is available. A build of SQLite without
/// FTS5 is not an error: search falls back to title matching.
pub fn init_schema(conn: &Connection, enable_fts: bool) -> rusqlite::Result<bool> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    if !enable_fts {
        return Ok(fts_available(conn));
    }

    match conn.execute_batch(FTS_TABLE_SQL) {
        Ok(()) => Ok(true),
        Err(e) => {
            tracing::warn!(error = %e, "FTS5 unavailable, lexical search falls back to title matching");
            Ok(false)
        }
    }
}

/// Whether the `archives_fts` table exists in this database.
pub fn fts_available(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'archives_fts'",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .unwrap_or(false)
}
