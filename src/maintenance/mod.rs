//! Background maintenance daemon.
//!
//! A dedicated thread wakes every health-check interval (the tick), runs the
//! health check, and runs checkpoint and vacuum once their interval has
//! elapsed since the last successful run. Last-run timestamps live in `maintenance_meta`, so the
//! schedule survives restarts. Every run, scheduled or triggered, appends a
//! `maintenance_log` row.

pub mod ops;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::archive::store::ContentStore;
use crate::archive::{format_timestamp, now_timestamp};
use crate::config::{parse_interval, ArchivistConfig};
use crate::db;
use crate::error::{EngineError, Result};
pub use ops::MaintenanceLogEntry;

const RECENT_LOG_ROWS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceOp {
    Checkpoint,
    Vacuum,
    HealthCheck,
    Reembed,
}

impl MaintenanceOp {
    pub const SCHEDULED: [MaintenanceOp; 3] = [Self::HealthCheck, Self::Checkpoint, Self::Vacuum];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Vacuum => "vacuum",
            Self::HealthCheck => "health_check",
            Self::Reembed => "reembed",
        }
    }

    fn meta_key(&self) -> String {
        format!("last_run:{}", self.as_str())
    }
}

impl std::fmt::Display for MaintenanceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MaintenanceOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "checkpoint" => Ok(Self::Checkpoint),
            "vacuum" => Ok(Self::Vacuum),
            "health_check" | "health" => Ok(Self::HealthCheck),
            "reembed" | "re_embed" => Ok(Self::Reembed),
            _ => Err(format!("unknown maintenance operation: {s}")),
        }
    }
}

/// Outcome of one maintenance run.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation: MaintenanceOp,
    pub success: bool,
    pub started_at: String,
    pub duration_seconds: f64,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReembedReport {
    pub dry_run: bool,
    pub stale_after_secs: u64,
    /// Task ids found stale (and, unless dry run, re-embedded or attempted).
    pub candidates: Vec<String>,
    pub reembedded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledStatus {
    pub operation: MaintenanceOp,
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_run: Option<String>,
    pub next_due: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceStatus {
    pub running: bool,
    pub tick_secs: u64,
    pub schedule: Vec<ScheduledStatus>,
    pub recent: Vec<MaintenanceLogEntry>,
}

/// Parsed intervals; `None` means the operation is disabled.
#[derive(Debug, Clone)]
struct Schedule {
    /// The health-check interval, used even when the check itself is off.
    tick: Duration,
    health_check: bool,
    checkpoint: Option<Duration>,
    vacuum: Option<Duration>,
}

impl Schedule {
    fn interval(&self, op: MaintenanceOp) -> Option<Duration> {
        match op {
            MaintenanceOp::HealthCheck => self.health_check.then_some(self.tick),
            MaintenanceOp::Checkpoint => self.checkpoint,
            MaintenanceOp::Vacuum => self.vacuum,
            MaintenanceOp::Reembed => None,
        }
    }
}

#[derive(Debug, Clone)]
struct BackupPolicy {
    enabled: bool,
    dir: PathBuf,
    retention: usize,
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct MaintenanceDaemon {
    store: Arc<ContentStore>,
    schedule: Schedule,
    backup: BackupPolicy,
    stale_after: Duration,
    /// Serializes runs, so a triggered operation never overlaps a scheduled one.
    run_lock: Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl MaintenanceDaemon {
    pub fn new(config: &ArchivistConfig, store: Arc<ContentStore>) -> anyhow::Result<Arc<Self>> {
        let m = &config.maintenance;
        let interval = |enabled: bool, raw: &str, name: &str| -> anyhow::Result<Option<Duration>> {
            if !enabled {
                return Ok(None);
            }
            parse_interval(raw)
                .with_context(|| format!("invalid maintenance.{name}"))
                .map(Some)
        };

        let schedule = Schedule {
            tick: parse_interval(&m.health_check_interval)
                .context("invalid maintenance.health_check_interval")?,
            health_check: m.health_check_enabled,
            checkpoint: interval(m.checkpoint_enabled, &m.checkpoint_interval, "checkpoint_interval")?,
            vacuum: interval(m.vacuum_enabled, &m.vacuum_interval, "vacuum_interval")?,
        };
        anyhow::ensure!(
            !schedule.tick.is_zero(),
            "maintenance.health_check_interval must be positive"
        );

        Ok(Arc::new(Self {
            store,
            schedule,
            backup: BackupPolicy {
                enabled: m.backup_before_vacuum,
                dir: config.resolved_backup_dir(),
                retention: m.backup_retention.max(1),
            },
            stale_after: parse_interval(&m.stale_after).context("invalid maintenance.stale_after")?,
            run_lock: Mutex::new(()),
            worker: Mutex::new(None),
        }))
    }

    /// Start the scheduler thread. No-op if already running.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (stop, stop_rx) = bounded::<()>(0);
        let daemon = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("maintenance".into())
            .spawn(move || {
                tracing::info!(tick_secs = daemon.schedule.tick.as_secs(), "maintenance daemon started");
                loop {
                    daemon.tick();
                    match stop_rx.recv_timeout(daemon.schedule.tick) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                tracing::info!("maintenance daemon stopped");
            })
            .context("failed to spawn maintenance thread")?;

        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stop the scheduler. Interrupts the sleep between ticks; an operation
    /// already running finishes first.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            drop(worker.stop);
            if worker.handle.join().is_err() {
                tracing::error!("maintenance thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// One scheduler pass: health check every tick, the rest when due.
    pub fn tick(&self) -> Vec<OperationReport> {
        let mut reports = Vec::new();
        for op in MaintenanceOp::SCHEDULED {
            let due = match op {
                MaintenanceOp::HealthCheck => self.schedule.health_check,
                _ => self.is_due(op),
            };
            if due {
                reports.push(self.run_operation(op));
            }
        }
        reports
    }

    /// Whether `op` is enabled and its interval has elapsed since the last
    /// persisted successful run.
    pub fn is_due(&self, op: MaintenanceOp) -> bool {
        let Some(interval) = self.schedule.interval(op) else {
            return false;
        };
        match self.last_run(op) {
            Some(last) => Utc::now().signed_duration_since(last).to_std().unwrap_or_default() >= interval,
            None => true,
        }
    }

    /// Run one operation now. Failures are logged and reported, never raised.
    pub fn run_operation(&self, op: MaintenanceOp) -> OperationReport {
        let _guard = self.run_lock.lock();
        match op {
            MaintenanceOp::Checkpoint => self.run_logged(op, || self.do_checkpoint()).0,
            MaintenanceOp::Vacuum => self.run_logged(op, || self.do_vacuum()).0,
            MaintenanceOp::HealthCheck => self.run_logged(op, || self.do_health_check()).0,
            MaintenanceOp::Reembed => {
                self.run_logged(op, || self.reembed_locked(self.stale_after, false)).0
            }
        }
    }

    /// Re-chunk and re-embed archives whose vectors are missing, older than
    /// `stale_after`, or from an older embedding version. A dry run only
    /// reports the affected set and is not logged.
    pub fn reembed(&self, stale_after: Option<Duration>, dry_run: bool) -> Result<ReembedReport> {
        let stale_after = stale_after.unwrap_or(self.stale_after);
        let _guard = self.run_lock.lock();
        if dry_run {
            return self.reembed_locked(stale_after, true);
        }
        self.run_logged(MaintenanceOp::Reembed, || self.reembed_locked(stale_after, false))
            .1
    }

    /// Time `f`, append a `maintenance_log` row, and advance the schedule on
    /// success. Caller holds `run_lock`.
    fn run_logged<T, E>(
        &self,
        op: MaintenanceOp,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> (OperationReport, std::result::Result<T, E>)
    where
        T: Serialize,
        E: std::fmt::Display,
    {
        let started_at = now_timestamp();
        let started = Instant::now();
        let db_path = self.store.db_path();
        let size_before = db_path.map(|p| ops::database_size(Some(p)));

        let result = f();

        let size_after = db_path.map(|p| ops::database_size(Some(p)));
        let duration_seconds = started.elapsed().as_secs_f64();
        let (mut success, details, mut error) = match &result {
            Ok(value) => (
                true,
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                None,
            ),
            Err(e) => (false, serde_json::Value::Null, Some(format!("{e:#}"))),
        };
        // A health check that ran but found corruption is still a failure.
        if details.get("integrity_ok") == Some(&serde_json::Value::Bool(false)) {
            success = false;
            error = Some(format!(
                "integrity check failed: {}",
                details["integrity_details"].as_str().unwrap_or_default()
            ));
        }

        let completed_at = now_timestamp();
        let logged = self.store.with_writer(|conn| -> anyhow::Result<()> {
            ops::write_log(
                conn,
                &ops::LogRecord {
                    operation: op.as_str(),
                    started_at: &started_at,
                    completed_at: &completed_at,
                    duration_seconds,
                    success,
                    details: &details,
                    error_message: error.as_deref(),
                    size_before,
                    size_after,
                },
            )?;
            if success {
                db::set_meta(conn, &op.meta_key(), &completed_at)?;
            }
            Ok(())
        });
        if let Err(e) = logged {
            tracing::warn!(operation = %op, error = %format!("{e:#}"), "failed to record maintenance run");
        }

        match &error {
            None => tracing::info!(operation = %op, duration_seconds, "maintenance operation completed"),
            Some(e) => tracing::error!(operation = %op, error = %e, "maintenance operation failed"),
        }

        let report = OperationReport {
            operation: op,
            success,
            started_at,
            duration_seconds,
            details,
            error,
        };
        (report, result)
    }

    fn reembed_locked(&self, stale_after: Duration, dry_run: bool) -> Result<ReembedReport> {
        let age = chrono::Duration::from_std(stale_after)
            .map_err(|e| EngineError::validation("stale_after", e.to_string()))?;
        let cutoff = Utc::now() - age;
        let candidates = self.store.stale_archives(cutoff)?;

        let mut report = ReembedReport {
            dry_run,
            stale_after_secs: stale_after.as_secs(),
            candidates,
            reembedded: 0,
            failed: 0,
            errors: Vec::new(),
        };
        if dry_run || report.candidates.is_empty() {
            tracing::info!(stale = report.candidates.len(), dry_run, "reembed scan finished");
            return Ok(report);
        }

        // Blocks until the model is ready; a load failure aborts the run.
        self.store.embedder().force_load()?;

        for task_id in &report.candidates {
            match self.store.refresh_embeddings(task_id) {
                Ok(true) => report.reembedded += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "reembed failed");
                    report.failed += 1;
                    report.errors.push(format!("{task_id}: {e}"));
                }
            }
        }
        tracing::info!(reembedded = report.reembedded, failed = report.failed, "reembed finished");
        Ok(report)
    }

    pub fn status(&self) -> Result<MaintenanceStatus> {
        let mut schedule = Vec::new();
        for op in MaintenanceOp::SCHEDULED {
            let interval = self.schedule.interval(op);
            let last_run = self.last_run(op);
            let next_due = match (interval, last_run) {
                (Some(interval), Some(last)) => chrono::Duration::from_std(interval)
                    .ok()
                    .map(|i| format_timestamp(last + i)),
                (Some(_), None) => Some(now_timestamp()),
                (None, _) => None,
            };
            schedule.push(ScheduledStatus {
                operation: op,
                enabled: interval.is_some(),
                interval_secs: interval.map(|i| i.as_secs()).unwrap_or(0),
                last_run: last_run.map(format_timestamp),
                next_due,
            });
        }

        let recent = self
            .store
            .with_writer(|conn| ops::recent_log(conn, RECENT_LOG_ROWS))?;
        Ok(MaintenanceStatus {
            running: self.is_running(),
            tick_secs: self.schedule.tick.as_secs(),
            schedule,
            recent,
        })
    }

    fn last_run(&self, op: MaintenanceOp) -> Option<DateTime<Utc>> {
        let raw = self
            .store
            .with_writer(|conn| db::get_meta(conn, &op.meta_key()))
            .ok()
            .flatten()?;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn do_checkpoint(&self) -> anyhow::Result<serde_json::Value> {
        let result = self.store.with_writer(|conn| ops::checkpoint(conn))?;
        if result.busy {
            tracing::warn!("checkpoint could not complete, readers still active");
        }
        Ok(serde_json::to_value(result)?)
    }

    fn do_vacuum(&self) -> anyhow::Result<serde_json::Value> {
        let db_path = self.store.db_path().map(|p| p.to_path_buf());
        self.store.with_writer(|conn| -> anyhow::Result<serde_json::Value> {
            let backup = match (&db_path, self.backup.enabled) {
                (Some(path), true) => Some(
                    ops::backup_database(conn, path, &self.backup.dir, self.backup.retention)
                        .context("backup failed, vacuum aborted")?,
                ),
                _ => None,
            };
            ops::vacuum(conn)?;
            // VACUUM rewrites through the WAL; fold it back in.
            if db_path.is_some() {
                ops::checkpoint(conn)?;
            }
            Ok(serde_json::json!({
                "backup": backup.map(|p| p.display().to_string()),
            }))
        })
    }

    fn do_health_check(&self) -> anyhow::Result<serde_json::Value> {
        let result = self
            .store
            .with_writer(|conn| ops::health_check(conn, self.store.db_path()))?;
        if result.report.unembedded_count > 0 {
            tracing::info!(unembedded = result.report.unembedded_count, "archives awaiting embeddings");
        }
        let idle_unloaded = self.store.embedder().unload_if_idle();
        let mut value = serde_json::to_value(result)?;
        value["model"] = serde_json::to_value(self.store.embedder().stats())?;
        value["model_unloaded"] = serde_json::Value::Bool(idle_unloaded);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::types::ArchiveInput;
    use crate::embedding::create_loader;
    use crate::embedding::service::EmbeddingService;

    fn test_config(dir: &std::path::Path) -> ArchivistConfig {
        let mut config = ArchivistConfig::default();
        config.storage.db_path = dir.join("archive.db").to_string_lossy().into_owned();
        config.embedding.provider = "hashing".into();
        config.embedding.disable_cleanup = true;
        config.maintenance.health_check_interval = "50ms".into();
        config
    }

    fn daemon(config: &ArchivistConfig) -> Arc<MaintenanceDaemon> {
        let embedder = EmbeddingService::new(&config.embedding, create_loader(&config.embedding).unwrap());
        let store = Arc::new(ContentStore::open(config, embedder).unwrap());
        MaintenanceDaemon::new(config, store).unwrap()
    }

    fn log_count(daemon: &MaintenanceDaemon, op: &str) -> i64 {
        daemon.store.with_writer(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM maintenance_log WHERE operation = ?1",
                [op],
                |r| r.get(0),
            )
            .unwrap()
        })
    }

    #[test]
    fn test_operation_names_parse() {
        for op in [MaintenanceOp::Checkpoint, MaintenanceOp::Vacuum, MaintenanceOp::HealthCheck, MaintenanceOp::Reembed] {
            assert_eq!(op.as_str().parse::<MaintenanceOp>().unwrap(), op);
        }
        assert_eq!("health-check".parse::<MaintenanceOp>().unwrap(), MaintenanceOp::HealthCheck);
        assert!("defrag".parse::<MaintenanceOp>().is_err());
    }

    #[test]
    fn test_first_tick_runs_everything_then_only_health() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(&test_config(dir.path()));

        let first: Vec<_> = daemon.tick().into_iter().map(|r| r.operation).collect();
        assert_eq!(first, MaintenanceOp::SCHEDULED.to_vec());

        let second: Vec<_> = daemon.tick().into_iter().map(|r| r.operation).collect();
        assert_eq!(second, vec![MaintenanceOp::HealthCheck]);
        assert_eq!(log_count(&daemon, "health_check"), 2);
        assert_eq!(log_count(&daemon, "vacuum"), 1);
    }

    #[test]
    fn test_last_run_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        daemon(&config).run_operation(MaintenanceOp::Checkpoint);

        let restarted = daemon(&config);
        assert!(!restarted.is_due(MaintenanceOp::Checkpoint));
        assert!(restarted.is_due(MaintenanceOp::Vacuum));
    }

    #[test]
    fn test_disabled_operations_never_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.maintenance.vacuum_enabled = false;
        config.maintenance.checkpoint_enabled = false;
        let daemon = daemon(&config);
        let ops: Vec<_> = daemon.tick().into_iter().map(|r| r.operation).collect();
        assert_eq!(ops, vec![MaintenanceOp::HealthCheck]);

        let status = daemon.status().unwrap();
        assert!(!status.schedule.iter().find(|s| s.operation == MaintenanceOp::Vacuum).unwrap().enabled);
    }

    #[test]
    fn test_vacuum_backs_up_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.maintenance.backup_retention = 1;
        let daemon = daemon(&config);

        for _ in 0..2 {
            let report = daemon.run_operation(MaintenanceOp::Vacuum);
            assert!(report.success, "{:?}", report.error);
            assert!(report.details["backup"].is_string());
        }
        let backups = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.path().extension().is_some_and(|x| x == "db"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn test_vacuum_aborts_when_backup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // A regular file where the backup directory should be.
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        config.maintenance.backup_dir = Some(blocker.to_string_lossy().into_owned());
        let daemon = daemon(&config);

        let report = daemon.run_operation(MaintenanceOp::Vacuum);
        assert!(!report.success);
        assert!(report.error.unwrap().contains("vacuum aborted"));
        assert!(daemon.is_due(MaintenanceOp::Vacuum), "failed runs do not advance the schedule");

        let recent = daemon.status().unwrap().recent;
        assert_eq!(recent[0].operation, "vacuum");
        assert!(!recent[0].success);
    }

    #[test]
    fn test_reembed_dry_run_then_real() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = daemon(&test_config(dir.path()));
        daemon.store.upsert(ArchiveInput::new("a", "alpha text")).unwrap();
        daemon.store.upsert(ArchiveInput::new("b", "beta text")).unwrap();
        daemon.store.with_writer(|conn| {
            conn.execute("UPDATE archives SET last_embedded_at = NULL", []).unwrap();
        });

        let dry = daemon.reembed(None, true).unwrap();
        assert_eq!(dry.candidates.len(), 2);
        assert_eq!(dry.reembedded, 0);
        assert_eq!(daemon.store.stale_archives(Utc::now() - chrono::Duration::days(1)).unwrap().len(), 2);

        let real = daemon.reembed(None, false).unwrap();
        assert_eq!(real.reembedded, 2);
        assert!(daemon.store.stale_archives(Utc::now() - chrono::Duration::days(1)).unwrap().is_empty());
        assert_eq!(log_count(&daemon, "reembed"), 1);
    }

    #[test]
    fn test_start_and_stop_interrupt_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.maintenance.health_check_interval = "1h".into();
        let daemon = daemon(&config);
        daemon.start().unwrap();
        assert!(daemon.is_running());

        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        daemon.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!daemon.is_running());
        assert!(log_count(&daemon, "health_check") >= 1);
    }
}
