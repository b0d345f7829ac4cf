use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::{self, HealthReport};

// ── Result types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointResult {
    /// SQLite could not complete the checkpoint because of a concurrent reader.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    #[serde(flatten)]
    pub report: HealthReport,
    pub db_size_bytes: u64,
    pub wal_size_bytes: u64,
}

/// A `maintenance_log` row.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceLogEntry {
    pub id: i64,
    pub operation: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub db_size_before_mb: Option<f64>,
    pub db_size_after_mb: Option<f64>,
    pub space_saved_bytes: Option<i64>,
}

// ── Operations ───────────────────────────────────────────────────────────────

/// Fold the WAL back into the main file and truncate it.
pub fn checkpoint(conn: &Connection) -> Result<CheckpointResult> {
    let (busy, log_frames, checkpointed_frames): (i64, i64, i64) = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .context("wal_checkpoint failed")?;
    Ok(CheckpointResult {
        busy: busy != 0,
        log_frames,
        checkpointed_frames,
    })
}

/// Rebuild the database file, reclaiming free pages.
pub fn vacuum(conn: &Connection) -> Result<()> {
    conn.execute_batch("VACUUM").context("VACUUM failed")?;
    Ok(())
}

/// Copy the database file into `backup_dir`, then prune the oldest copies
/// beyond `retention`. The WAL is checkpointed first so the copy is complete.
pub fn backup_database(
    conn: &Connection,
    db_path: &Path,
    backup_dir: &Path,
    retention: usize,
) -> Result<PathBuf> {
    std::fs::create_dir_all(backup_dir)
        .with_context(|| format!("failed to create backup directory {}", backup_dir.display()))?;

    let cp = checkpoint(conn)?;
    anyhow::ensure!(!cp.busy, "checkpoint before backup was blocked by a reader");

    let prefix = backup_prefix(db_path);
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ");
    let target = backup_dir.join(format!("{prefix}{stamp}.db"));
    std::fs::copy(db_path, &target).with_context(|| {
        format!(
            "failed to copy {} to {}",
            db_path.display(),
            target.display()
        )
    })?;

    let pruned = prune_backups(backup_dir, &prefix, retention)?;
    tracing::info!(backup = %target.display(), pruned, "database backed up");
    Ok(target)
}

/// Delete all but the newest `retention` backups. Returns how many were removed.
pub fn prune_backups(backup_dir: &Path, prefix: &str, retention: usize) -> Result<usize> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(backup_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix) && n.ends_with(".db"))
        })
        .collect();
    // Timestamped names sort chronologically.
    backups.sort();

    let excess = backups.len().saturating_sub(retention);
    for old in &backups[..excess] {
        std::fs::remove_file(old)
            .with_context(|| format!("failed to remove old backup {}", old.display()))?;
    }
    Ok(excess)
}

/// Integrity check, row counts, and on-disk sizes.
pub fn health_check(conn: &Connection, db_path: Option<&Path>) -> Result<HealthCheckResult> {
    let report = db::check_database_health(conn)?;
    let (db_size_bytes, wal_size_bytes) = match db_path {
        Some(path) => (db::file_size(path), db::file_size(&db::sidecar_paths(path).0)),
        None => (0, 0),
    };
    Ok(HealthCheckResult {
        report,
        db_size_bytes,
        wal_size_bytes,
    })
}

/// Main file plus WAL, in bytes.
pub fn database_size(db_path: Option<&Path>) -> u64 {
    db_path
        .map(|path| db::file_size(path) + db::file_size(&db::sidecar_paths(path).0))
        .unwrap_or(0)
}

// ── Audit log ────────────────────────────────────────────────────────────────

/// Values for one `maintenance_log` insert.
pub struct LogRecord<'a> {
    pub operation: &'a str,
    pub started_at: &'a str,
    pub completed_at: &'a str,
    pub duration_seconds: f64,
    pub success: bool,
    pub details: &'a serde_json::Value,
    pub error_message: Option<&'a str>,
    pub size_before: Option<u64>,
    pub size_after: Option<u64>,
}

pub fn write_log(conn: &Connection, record: &LogRecord<'_>) -> Result<i64> {
    let to_mb = |bytes: u64| bytes as f64 / (1024.0 * 1024.0);
    let saved = match (record.size_before, record.size_after) {
        (Some(before), Some(after)) => Some(before as i64 - after as i64),
        _ => None,
    };
    conn.execute(
        "INSERT INTO maintenance_log (operation, started_at, completed_at, duration_seconds, \
         success, details, error_message, db_size_before_mb, db_size_after_mb, space_saved_bytes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.operation,
            record.started_at,
            record.completed_at,
            record.duration_seconds,
            record.success,
            record.details.to_string(),
            record.error_message,
            record.size_before.map(to_mb),
            record.size_after.map(to_mb),
            saved,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent log rows, newest first.
pub fn recent_log(conn: &Connection, limit: usize) -> Result<Vec<MaintenanceLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, operation, started_at, completed_at, duration_seconds, success, details, \
         error_message, db_size_before_mb, db_size_after_mb, space_saved_bytes \
         FROM maintenance_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            let details: Option<String> = row.get(6)?;
            Ok(MaintenanceLogEntry {
                id: row.get(0)?,
                operation: row.get(1)?,
                started_at: row.get(2)?,
                completed_at: row.get(3)?,
                duration_seconds: row.get(4)?,
                success: row.get(5)?,
                details: details.and_then(|s| serde_json::from_str(&s).ok()),
                error_message: row.get(7)?,
                db_size_before_mb: row.get(8)?,
                db_size_after_mb: row.get(9)?,
                space_saved_bytes: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn backup_prefix(db_path: &Path) -> String {
    let stem = db_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".into());
    format!("{stem}-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_db(dir: &Path) -> (Connection, PathBuf) {
        let path = dir.join("archive.db");
        let (conn, _) = db::open_database(&path, true, 5000).unwrap();
        conn.execute_batch(
            "INSERT INTO archives (task_id, title, content_hash, content, created_at, updated_at) \
             VALUES ('a', 'A', 'h', 'body', 'now', 'now')",
        )
        .unwrap();
        (conn, path)
    }

    #[test]
    fn test_checkpoint_truncates_wal() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, path) = file_db(dir.path());
        let result = checkpoint(&conn).unwrap();
        assert!(!result.busy);
        assert_eq!(db::file_size(&db::sidecar_paths(&path).0), 0);
    }

    #[test]
    fn test_backup_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, path) = file_db(dir.path());
        let backups = dir.path().join("backups");

        let mut made = Vec::new();
        for _ in 0..4 {
            made.push(backup_database(&conn, &path, &backups, 2).unwrap());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let remaining: Vec<_> = std::fs::read_dir(&backups).unwrap().collect();
        assert_eq!(remaining.len(), 2);
        assert!(made[3].exists());
        assert!(!made[0].exists());

        // The copy is a valid database with the row.
        let copy = Connection::open(&made[3]).unwrap();
        let n: i64 = copy
            .query_row("SELECT COUNT(*) FROM archives", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_backup_fails_for_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::open_memory_database().unwrap();
        let err = backup_database(&conn, &dir.path().join("missing.db"), dir.path(), 3);
        assert!(err.is_err());
    }

    #[test]
    fn test_health_check_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let (conn, path) = file_db(dir.path());
        let result = health_check(&conn, Some(&path)).unwrap();
        assert!(result.report.integrity_ok);
        assert_eq!(result.report.archive_count, 1);
        assert!(result.db_size_bytes > 0);
    }

    #[test]
    fn test_log_round_trip() {
        let conn = db::open_memory_database().unwrap();
        let details = serde_json::json!({"note": "ok"});
        write_log(
            &conn,
            &LogRecord {
                operation: "vacuum",
                started_at: "2024-01-01T00:00:00Z",
                completed_at: "2024-01-01T00:00:01Z",
                duration_seconds: 1.0,
                success: false,
                details: &details,
                error_message: Some("backup failed"),
                size_before: Some(2 * 1024 * 1024),
                size_after: Some(1024 * 1024),
            },
        )
        .unwrap();

        let rows = recent_log(&conn, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].operation, "vacuum");
        assert!(!rows[0].success);
        assert_eq!(rows[0].space_saved_bytes, Some(1024 * 1024));
        assert_eq!(rows[0].db_size_before_mb, Some(2.0));
        assert_eq!(rows[0].details, Some(details));
    }
}
