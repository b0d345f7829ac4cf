mod helpers;

use std::time::Duration;

use archivist::{ArchiveInput, Engine, EngineError, MaintenanceOp};
use tempfile::TempDir;

fn log_rows(dir: &std::path::Path, op: &str) -> i64 {
    helpers::raw_conn(dir)
        .query_row(
            "SELECT COUNT(*) FROM maintenance_log WHERE operation = ?1",
            [op],
            |row| row.get(0),
        )
        .unwrap()
}

#[test]
fn triggered_operations_are_logged_and_scheduled() {
    let tmp = TempDir::new().unwrap();
    let engine = helpers::test_engine(tmp.path());
    engine.upsert(ArchiveInput::new("m-1", "# Notes\n\nsome body text")).unwrap();

    for op in [MaintenanceOp::HealthCheck, MaintenanceOp::Checkpoint, MaintenanceOp::Vacuum] {
        let report = engine.trigger_maintenance(op);
        assert!(report.success, "{op} failed: {:?}", report.error);
        assert_eq!(report.operation, op);
        assert!(report.duration_seconds >= 0.0);
    }

    let health = engine.trigger_maintenance(MaintenanceOp::HealthCheck);
    assert_eq!(health.details["integrity_ok"], true);
    assert_eq!(health.details["archive_count"], 1);

    let status = engine.maintenance_status().unwrap();
    assert!(!status.running);
    for scheduled in &status.schedule {
        assert!(scheduled.enabled);
        assert!(scheduled.last_run.is_some(), "{} never ran", scheduled.operation);
        assert!(scheduled.next_due.is_some());
    }
    assert_eq!(status.recent.len(), 4);
    // Newest first.
    assert_eq!(status.recent[0].operation, "health_check");

    assert_eq!(log_rows(tmp.path(), "health_check"), 2);
    assert_eq!(log_rows(tmp.path(), "vacuum"), 1);
}

#[test]
fn vacuum_keeps_a_bounded_set_of_backups() {
    let tmp = TempDir::new().unwrap();
    let mut config = helpers::test_config(tmp.path());
    config.maintenance.backup_dir = Some(tmp.path().join("snapshots").to_string_lossy().into_owned());
    config.maintenance.backup_retention = 2;
    let engine = Engine::open(config).unwrap();
    engine.upsert(ArchiveInput::new("v-1", "vacuum me")).unwrap();

    for _ in 0..3 {
        let report = engine.trigger_maintenance(MaintenanceOp::Vacuum);
        assert!(report.success, "{:?}", report.error);
        assert!(report.details["backup"].is_string());
        // Backup names carry a microsecond timestamp; keep them distinct.
        std::thread::sleep(Duration::from_millis(5));
    }

    let backups = std::fs::read_dir(tmp.path().join("snapshots"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "db"))
        .count();
    assert_eq!(backups, 2);
    assert_eq!(engine.get("v-1").unwrap().unwrap().content, "vacuum me");
}

#[test]
fn disabled_provider_degrades_then_reembed_recovers() {
    let tmp = TempDir::new().unwrap();

    {
        let mut config = helpers::test_config(tmp.path());
        config.embedding.provider = "disabled".into();
        let engine = Engine::open(config).unwrap();
        engine
            .upsert(ArchiveInput::new("auth", "# Auth\n\nJWT tokens with refresh rotation"))
            .unwrap();
        engine
            .upsert(ArchiveInput::new("db", "# Database\n\nPostgres connection pooling"))
            .unwrap();

        let hits = engine.search(&engine.query("JWT").with_min_score(0.0)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].task_id, "auth");

        // No model, so the real run fails and is logged as a failure.
        let err = engine.reembed(None, false).unwrap_err();
        assert!(matches!(err, EngineError::ModelUnavailable(_)));
        engine.shutdown(Duration::from_secs(5));
    }
    assert_eq!(log_rows(tmp.path(), "reembed"), 1);

    let engine = helpers::test_engine(tmp.path());
    let dry = engine.reembed(None, true).unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.candidates.len(), 2);
    assert_eq!(dry.reembedded, 0);

    let real = engine.reembed(None, false).unwrap();
    assert_eq!(real.reembedded, 2);
    assert_eq!(real.failed, 0);
    assert!(engine.reembed(None, true).unwrap().candidates.is_empty());

    let conn = helpers::raw_conn(tmp.path());
    assert!(!helpers::chunk_row_ids(&conn, "auth").is_empty());
    let unembedded: i64 = conn
        .query_row("SELECT COUNT(*) FROM archives WHERE last_embedded_at IS NULL", [], |r| r.get(0))
        .unwrap();
    assert_eq!(unembedded, 0);

    let hits = engine.search(&engine.query("Postgres pooling").with_min_score(0.0)).unwrap();
    assert_eq!(hits[0].task_id, "db");
}

#[test]
fn reembed_with_zero_age_refreshes_everything() {
    let tmp = TempDir::new().unwrap();
    let engine = helpers::test_engine(tmp.path());
    engine.upsert(ArchiveInput::new("fresh", "just embedded")).unwrap();

    assert!(engine.reembed(None, true).unwrap().candidates.is_empty());

    std::thread::sleep(Duration::from_millis(10));
    let report = engine.reembed(Some(Duration::ZERO), false).unwrap();
    assert_eq!(report.candidates, vec!["fresh".to_string()]);
    assert_eq!(report.reembedded, 1);
}

#[test]
fn background_daemon_runs_on_its_own() {
    let tmp = TempDir::new().unwrap();
    let mut config = helpers::test_config(tmp.path());
    config.maintenance.enabled = true;
    config.maintenance.health_check_interval = "100ms".into();
    let engine = Engine::open(config).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while log_rows(tmp.path(), "health_check") < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(engine.maintenance_status().unwrap().running);
    assert!(log_rows(tmp.path(), "health_check") >= 2);

    engine.shutdown(Duration::from_secs(5));
    assert!(!engine.maintenance_status().unwrap().running);
}
