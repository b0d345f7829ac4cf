#![allow(dead_code)]

use std::path::{Path, PathBuf};

use archivist::{ArchivistConfig, Engine};
use rusqlite::Connection;

/// Config for an on-disk engine under `dir`: hashing embeddings, synchronous
/// writes, no background maintenance, no idle timer.
pub fn test_config(dir: &Path) -> ArchivistConfig {
    let mut config = ArchivistConfig::default();
    config.storage.db_path = db_path(dir).to_string_lossy().into_owned();
    config.embedding.provider = "hashing".into();
    config.embedding.disable_cleanup = true;
    config.queue.async_writes = false;
    config.queue.workers = 2;
    config.maintenance.enabled = false;
    config.indexer.workers = 2;
    config
}

pub fn db_path(dir: &Path) -> PathBuf {
    dir.join("archive.db")
}

pub fn test_engine(dir: &Path) -> Engine {
    Engine::open(test_config(dir)).unwrap()
}

pub fn memory_engine() -> Engine {
    let mut config = test_config(Path::new("/unused"));
    config.storage.db_path = ":memory:".into();
    Engine::open_in_memory(config).unwrap()
}

/// Separate connection onto the engine's file, for asserting on raw rows.
pub fn raw_conn(dir: &Path) -> Connection {
    Connection::open(db_path(dir)).unwrap()
}

/// Surrogate ids of an archive's chunks, in chunk order.
pub fn chunk_row_ids(conn: &Connection, task_id: &str) -> Vec<i64> {
    let mut stmt = conn
        .prepare("SELECT id FROM embeddings WHERE task_id = ?1 ORDER BY chunk_id")
        .unwrap();
    stmt.query_map([task_id], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<i64>, _>>()
        .unwrap()
}

/// Write `content` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, content).unwrap();
    path
}
