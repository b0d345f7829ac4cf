mod helpers;

use archivist::queue::WriteOutcome;
use archivist::{ArchiveInput, EngineError, UpsertOutcome, WriteReceipt};
use helpers::{chunk_row_ids, raw_conn, test_engine};
use tempfile::TempDir;

fn applied(outcome: UpsertOutcome) -> WriteReceipt {
    WriteReceipt::Applied(WriteOutcome::Upserted(outcome))
}

#[test]
fn identical_content_under_another_id_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = test_engine(tmp.path());

    engine
        .upsert(ArchiveInput::new("task-a", "Shared body text").with_title("Original"))
        .unwrap();
    let before = engine.get("task-a").unwrap().unwrap();

    let err = engine
        .upsert(ArchiveInput::new("task-b", "Shared body text").with_title("Copy"))
        .unwrap_err();
    match err {
        EngineError::DuplicateContent {
            task_id,
            existing_task_id,
        } => {
            assert_eq!(task_id, "task-b");
            assert_eq!(existing_task_id, "task-a");
        }
        other => panic!("expected DuplicateContent, got {other:?}"),
    }

    assert!(engine.get("task-b").unwrap().is_none());
    let after = engine.get("task-a").unwrap().unwrap();
    assert_eq!(after.title, before.title);
    assert_eq!(after.updated_at, before.updated_at);
}

#[test]
fn same_id_same_content_skips_chunk_regeneration() {
    let tmp = TempDir::new().unwrap();
    let engine = test_engine(tmp.path());

    let first = engine.upsert(ArchiveInput::new("task-a", "Stable content")).unwrap();
    assert_eq!(first, applied(UpsertOutcome::Inserted));
    let conn = raw_conn(tmp.path());
    let chunks_before = chunk_row_ids(&conn, "task-a");
    assert!(!chunks_before.is_empty());

    let second = engine.upsert(ArchiveInput::new("task-a", "Stable content")).unwrap();
    assert_eq!(second, applied(UpsertOutcome::Unchanged));
    assert_eq!(chunk_row_ids(&conn, "task-a"), chunks_before);
}

#[test]
fn force_reindex_regenerates_chunks() {
    let tmp = TempDir::new().unwrap();
    let engine = test_engine(tmp.path());

    engine.upsert(ArchiveInput::new("task-a", "Stable content")).unwrap();
    let conn = raw_conn(tmp.path());
    let chunks_before = chunk_row_ids(&conn, "task-a");

    let forced = engine
        .upsert(ArchiveInput::new("task-a", "Stable content").forced())
        .unwrap();
    assert_eq!(forced, applied(UpsertOutcome::Updated));
    let chunks_after = chunk_row_ids(&conn, "task-a");
    assert_eq!(chunks_after.len(), chunks_before.len());
    assert_ne!(chunks_after, chunks_before);
}

#[test]
fn changed_content_updates_row() {
    let tmp = TempDir::new().unwrap();
    let engine = test_engine(tmp.path());

    engine.upsert(ArchiveInput::new("task-a", "# Draft\n\nfirst")).unwrap();
    let updated = engine.upsert(ArchiveInput::new("task-a", "# Final\n\nsecond")).unwrap();
    assert_eq!(updated, applied(UpsertOutcome::Updated));

    let archive = engine.get("task-a").unwrap().unwrap();
    assert_eq!(archive.title, "Final");
    assert_eq!(archive.content, "# Final\n\nsecond");

    // The old content is free again for another id.
    engine.upsert(ArchiveInput::new("task-b", "# Draft\n\nfirst")).unwrap();
}

#[test]
fn filepath_owned_by_another_id_is_a_duplicate() {
    let tmp = TempDir::new().unwrap();
    let engine = test_engine(tmp.path());

    engine
        .upsert(ArchiveInput::new("task-a", "one").with_filepath("/notes/a.md"))
        .unwrap();
    let err = engine
        .upsert(ArchiveInput::new("task-b", "two").with_filepath("/notes/a.md"))
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateContent { .. }), "{err:?}");
    assert!(engine.get("task-b").unwrap().is_none());
}
