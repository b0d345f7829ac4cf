mod helpers;

use archivist::db;
use archivist::db::migrations::{get_embedding_model, get_schema_version, run_migrations, CURRENT_SCHEMA_VERSION};
use archivist::{ArchiveInput, Engine, MaintenanceOp};
use rusqlite::Connection;
use tempfile::TempDir;

#[test]
fn fresh_file_migrates_to_current_version() {
    let tmp = TempDir::new().unwrap();
    let (conn, _) = db::open_database(helpers::db_path(tmp.path()), true, 1000).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    // Only a store knows which model it runs.
    assert!(get_embedding_model(&conn).unwrap().is_none());
}

#[test]
fn v1_file_upgrades_on_open_and_keeps_rows() {
    let tmp = TempDir::new().unwrap();
    let path = helpers::db_path(tmp.path());

    // A database last written by a v1 binary.
    {
        let conn = Connection::open(&path).unwrap();
        db::schema::init_schema(&conn, true).unwrap();
        conn.execute(
            "INSERT INTO archives (task_id, title, content_hash, content, created_at, updated_at) \
             VALUES ('legacy', 'Legacy', 'hash-1', 'old body', '2023-01-01T00:00:00.000000Z', '2023-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
        assert!(get_embedding_model(&conn).unwrap().is_none());
    }

    let engine = helpers::test_engine(tmp.path());
    let legacy = engine.get("legacy").unwrap().unwrap();
    assert_eq!(legacy.content, "old body");
    assert!(legacy.last_embedded_at.is_none());
    drop(engine);

    let conn = helpers::raw_conn(tmp.path());
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    assert_eq!(get_embedding_model(&conn).unwrap().as_deref(), Some("hashing"));
}

#[test]
fn health_reports_the_configured_model() {
    let tmp = TempDir::new().unwrap();
    let engine = helpers::test_engine(tmp.path());
    let health = engine.trigger_maintenance(MaintenanceOp::HealthCheck);
    assert!(health.success);
    assert_eq!(health.details["embedding_model"], "hashing");
    drop(engine);

    let mut config = helpers::test_config(tmp.path());
    config.embedding.provider = "local".into();
    config.embedding.model = "bge-small-en-v1.5".into();
    let engine = Engine::open(config).unwrap();
    let conn = helpers::raw_conn(tmp.path());
    assert_eq!(get_embedding_model(&conn).unwrap().as_deref(), Some("bge-small-en-v1.5"));
    drop(engine);
}

#[test]
fn reopening_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = helpers::test_engine(tmp.path());
        engine.upsert(ArchiveInput::new("kept", "survives reopen")).unwrap();
    }
    let engine = helpers::test_engine(tmp.path());
    assert_eq!(engine.get("kept").unwrap().unwrap().content, "survives reopen");

    let conn = helpers::raw_conn(tmp.path());
    run_migrations(&conn).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn concurrent_opens_of_a_fresh_file_agree() {
    let tmp = TempDir::new().unwrap();
    let path = helpers::db_path(tmp.path());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let (conn, _) = db::open_database(&path, true, 5000).unwrap();
                get_schema_version(&conn).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), CURRENT_SCHEMA_VERSION);
    }
}
