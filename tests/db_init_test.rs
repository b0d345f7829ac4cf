use archivist::db;
use rusqlite::Connection;
use tempfile::TempDir;

fn names(conn: &Connection, kind: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = ?1 AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .unwrap();
    stmt.query_map([kind], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<String>, _>>()
        .unwrap()
}

#[test]
fn full_schema_creates_all_tables_and_indexes() {
    let conn = db::open_memory_database().unwrap();

    let tables = names(&conn, "table");
    for table in ["archives", "embeddings", "maintenance_log", "maintenance_meta", "schema_meta", "archives_fts"] {
        assert!(tables.iter().any(|t| t == table), "missing table {table}: {tables:?}");
    }

    let indexes = names(&conn, "index");
    for index in [
        "idx_archives_kind",
        "idx_archives_status",
        "idx_archives_completed",
        "idx_archives_embedded",
        "idx_archives_recency",
        "idx_embeddings_task",
        "idx_maintenance_log_op",
    ] {
        assert!(indexes.iter().any(|i| i == index), "missing index {index}: {indexes:?}");
    }
}

#[test]
fn schema_init_is_idempotent() {
    let conn = db::open_memory_database().unwrap();
    assert!(db::schema::init_schema(&conn, true).unwrap());
    db::migrations::run_migrations(&conn).unwrap();
    assert_eq!(
        db::migrations::get_schema_version(&conn).unwrap(),
        db::migrations::CURRENT_SCHEMA_VERSION
    );
}

#[test]
fn fts_can_be_disabled() {
    let tmp = TempDir::new().unwrap();
    let (conn, fts) = db::open_database(tmp.path().join("plain.db"), false, 1000).unwrap();
    assert!(!fts);
    assert!(!db::schema::fts_available(&conn));
    assert!(!names(&conn, "table").iter().any(|t| t == "archives_fts"));
}

#[test]
fn check_constraints_reject_unknown_enums() {
    let conn = db::open_memory_database().unwrap();
    let insert = |kind: &str, status: Option<&str>| {
        conn.execute(
            "INSERT INTO archives (task_id, title, content_hash, content, kind, status, created_at, updated_at) \
             VALUES (?1, 't', ?1, 'c', ?2, ?3, 'now', 'now')",
            rusqlite::params![format!("{kind}-{status:?}"), kind, status],
        )
    };
    assert!(insert("doc", Some("done")).is_ok());
    assert!(insert("doc", None).is_ok());
    assert!(insert("memo", None).is_err());
    assert!(insert("code", Some("finished")).is_err());
}

#[test]
fn deleting_an_archive_cascades_to_chunks() {
    let conn = db::open_memory_database().unwrap();
    conn.execute_batch(
        "INSERT INTO archives (task_id, title, content_hash, content, created_at, updated_at) \
         VALUES ('a', 't', 'h', 'c', 'now', 'now');
         INSERT INTO embeddings (task_id, chunk_id, position, vector) VALUES ('a', 0, 0, x'00000000');",
    )
    .unwrap();
    conn.execute("DELETE FROM archives WHERE task_id = 'a'", []).unwrap();
    let left: i64 = conn
        .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
        .unwrap();
    assert_eq!(left, 0);
}
