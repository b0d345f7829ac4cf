//! Content Store: validation, deduplication, chunk regeneration and the
//! lexical index, over one writer and one reader connection.
//!
//! [`ContentStore::upsert`] is the single write entry point. Chunking and
//! embedding happen before the writer lock is taken; the row, its chunks and
//! its FTS entry are then replaced in one transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::chunk::{chunk, preprocess, strip_front_matter};
use super::search::{hybrid_search, lexical_search, RepresentativePolicy, SearchQuery};
use super::types::{Archive, ArchiveInput, ArchiveKind, SearchResult, UpsertOutcome};
use super::{content_hash, embedding_to_bytes, format_timestamp, now_timestamp};
use crate::config::ArchivistConfig;
use crate::db;
use crate::embedding::is_zero_vector;
use crate::embedding::service::EmbeddingService;
use crate::error::{EngineError, Result};
use crate::queue::{WriteExecutor, WriteOp, WriteOutcome};

pub const MAX_TASK_ID_LEN: usize = 200;
const SUMMARY_CHARS: usize = 200;

const ARCHIVE_COLUMNS: &str = "task_id, title, filepath, content_hash, content, kind, status, \
     completed_at, summary, created_at, updated_at, embedding_version, last_embedded_at";

/// One embedded chunk, ready to insert.
struct ChunkVector {
    position: usize,
    vector: Vec<f32>,
}

/// What the database already holds for an incoming upsert.
enum Existing {
    New,
    /// Same id, different content.
    Changed,
    /// Same id, same content.
    Same,
    /// The content hash belongs to another task id.
    OwnedBy(String),
}

pub struct ContentStore {
    writer: Mutex<Connection>,
    /// Separate WAL reader so searches never wait on the writer lock. `None`
    /// for in-memory stores, where a second connection would be a second DB.
    reader: Option<Mutex<Connection>>,
    db_path: Option<PathBuf>,
    fts: bool,
    embedder: Arc<EmbeddingService>,
    chunk_size: usize,
    max_content_bytes: usize,
    embedding_version: i64,
    representative: RepresentativePolicy,
}

impl ContentStore {
    /// Open the on-disk store described by `config`.
    pub fn open(config: &ArchivistConfig, embedder: Arc<EmbeddingService>) -> anyhow::Result<Self> {
        let path = config.resolved_db_path();
        let storage = &config.storage;
        let (writer, fts) = db::open_database(&path, storage.enable_fts, storage.busy_timeout_ms)?;
        let (reader, _) = db::open_database(&path, storage.enable_fts, storage.busy_timeout_ms)
            .context("failed to open reader connection")?;
        reader.pragma_update(None, "query_only", true)?;
        record_model(&writer, config)?;

        tracing::info!(path = %path.display(), fts, "content store opened");
        Ok(Self::assemble(config, embedder, writer, Some(reader), Some(path), fts))
    }

    /// Single-connection store backed by an in-memory database.
    pub fn open_in_memory(config: &ArchivistConfig, embedder: Arc<EmbeddingService>) -> anyhow::Result<Self> {
        let conn = db::open_memory_database()?;
        let fts = db::schema::fts_available(&conn);
        record_model(&conn, config)?;
        Ok(Self::assemble(config, embedder, conn, None, None, fts))
    }

    fn assemble(
        config: &ArchivistConfig,
        embedder: Arc<EmbeddingService>,
        writer: Connection,
        reader: Option<Connection>,
        db_path: Option<PathBuf>,
        fts: bool,
    ) -> Self {
        Self {
            writer: Mutex::new(writer),
            reader: reader.map(Mutex::new),
            db_path,
            fts,
            embedder,
            chunk_size: config.search.chunk_size.max(1),
            max_content_bytes: config.storage.max_content_bytes,
            embedding_version: config.embedding.embedding_version,
            representative: config.search.representative,
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts
    }

    pub fn embedder(&self) -> &Arc<EmbeddingService> {
        &self.embedder
    }

    pub fn embedding_version(&self) -> i64 {
        self.embedding_version
    }

    /// Run `f` with exclusive use of the writer connection.
    pub(crate) fn with_writer<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        let mut conn = self.writer.lock();
        f(&mut conn)
    }

    fn read_conn(&self) -> MutexGuard<'_, Connection> {
        self.reader.as_ref().unwrap_or(&self.writer).lock()
    }

    /// Insert or replace an archive and regenerate its chunks.
    ///
    /// Content already owned by another task id is rejected with
    /// [`EngineError::DuplicateContent`] and nothing is written. When the
    /// embedding model is unavailable the row is still stored, without
    /// chunks, and `reembed` picks it up later.
    pub fn upsert(&self, input: ArchiveInput) -> Result<UpsertOutcome> {
        let input = self.validate(input)?;
        let hash = content_hash(&input.content);

        // Cheap pre-check on the reader: skip embedding work for duplicates.
        match existing(&self.read_conn(), &input.task_id, &hash)? {
            Existing::OwnedBy(owner) => return Err(duplicate(&input.task_id, owner)),
            Existing::Same if !input.force_reindex => {
                tracing::debug!(task_id = %input.task_id, "content unchanged, skipping");
                return Ok(UpsertOutcome::Unchanged);
            }
            _ => {}
        }

        let chunks = match self.embed_chunks(&input.content) {
            Ok(chunks) => Some(chunks),
            Err(EngineError::ModelUnavailable(reason)) => {
                tracing::warn!(task_id = %input.task_id, %reason, "storing without embeddings");
                None
            }
            Err(e) => return Err(e),
        };

        let mut conn = self.writer.lock();
        // Take the write lock up front; a deferred read-then-write can fail
        // with SQLITE_BUSY without waiting when another process writes.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Re-check under the write lock; another writer may have won the race.
        let state = existing(&tx, &input.task_id, &hash)?;
        // A forced reindex that could not embed leaves the current vectors alone;
        // they still describe this exact content.
        let keep_vectors = matches!(state, Existing::Same) && chunks.is_none();
        let outcome = match state {
            Existing::OwnedBy(owner) => return Err(duplicate(&input.task_id, owner)),
            Existing::Same if !input.force_reindex => return Ok(UpsertOutcome::Unchanged),
            Existing::New => UpsertOutcome::Inserted,
            Existing::Changed | Existing::Same => UpsertOutcome::Updated,
        };

        let now = now_timestamp();
        let embedded_at = chunks.as_ref().map(|_| now.clone());
        let summary = summarize(&input.content);
        let title = input
            .title
            .clone()
            .unwrap_or_else(|| derive_title(&input.content, input.filepath.as_deref(), &input.task_id));

        let written = tx.execute(
            "INSERT INTO archives (task_id, title, filepath, content_hash, content, kind, status, \
             completed_at, summary, created_at, updated_at, embedding_version, last_embedded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12) \
             ON CONFLICT(task_id) DO UPDATE SET \
                title = excluded.title, filepath = excluded.filepath, \
                content_hash = excluded.content_hash, content = excluded.content, \
                kind = excluded.kind, status = excluded.status, \
                completed_at = excluded.completed_at, summary = excluded.summary, \
                updated_at = excluded.updated_at, \
                embedding_version = CASE WHEN ?13 THEN archives.embedding_version \
                    ELSE excluded.embedding_version END, \
                last_embedded_at = CASE WHEN ?13 THEN archives.last_embedded_at \
                    ELSE excluded.last_embedded_at END",
            params![
                input.task_id,
                title,
                input.filepath,
                hash,
                input.content,
                input.kind.unwrap_or(ArchiveKind::Archive).as_str(),
                input.status.map(|s| s.as_str()),
                input.completed_at,
                summary,
                now,
                self.embedding_version,
                embedded_at,
                keep_vectors,
            ],
        );
        if let Err(e) = written {
            return Err(translate_conflict(&tx, e, &input.task_id, &hash, input.filepath.as_deref()));
        }

        if !keep_vectors {
            replace_chunks(&tx, &input.task_id, chunks.as_deref().unwrap_or_default())?;
        }
        if self.fts {
            refresh_fts(&tx, &input.task_id, &title, &input.content)?;
        }
        tx.commit()?;

        tracing::debug!(
            task_id = %input.task_id,
            ?outcome,
            chunks = chunks.as_ref().map(Vec::len).unwrap_or(0),
            "archive stored"
        );
        Ok(outcome)
    }

    /// Fetch one archive. Missing ids are `Ok(None)`.
    pub fn get(&self, task_id: &str) -> Result<Option<Archive>> {
        let conn = self.read_conn();
        let archive = conn
            .query_row(
                &format!("SELECT {ARCHIVE_COLUMNS} FROM archives WHERE task_id = ?1"),
                [task_id],
                row_to_archive,
            )
            .optional()?;
        Ok(archive)
    }

    /// Delete an archive, its chunks and its FTS row. Returns whether it existed.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if self.fts {
            tx.execute("DELETE FROM archives_fts WHERE task_id = ?1", [task_id])?;
        }
        // Chunks go with the row (ON DELETE CASCADE).
        let deleted = tx.execute("DELETE FROM archives WHERE task_id = ?1", [task_id])?;
        tx.commit()?;

        if deleted > 0 {
            tracing::debug!(task_id, "archive deleted");
        }
        Ok(deleted > 0)
    }

    /// The `n` most recent archives: by `completed_at`, falling back to
    /// `updated_at` where the completion date is missing.
    pub fn list_latest(&self, n: usize, kind: Option<ArchiveKind>) -> Result<Vec<Archive>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM archives \
             WHERE (?1 IS NULL OR kind = ?1) \
             ORDER BY COALESCE(completed_at, updated_at) DESC, updated_at DESC, task_id \
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![kind.map(|k| k.as_str()), n as i64], row_to_archive)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Hybrid search, degrading to lexical search when no query vector can
    /// be produced.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        if query.text.trim().is_empty() || query.k == 0 {
            return Ok(Vec::new());
        }

        let vector = match self.embedder.embed(&query.text) {
            Ok(v) if !is_zero_vector(&v) => Some(v),
            Ok(_) => None,
            Err(EngineError::ModelUnavailable(reason)) => {
                tracing::warn!(%reason, "embedding unavailable, lexical search only");
                None
            }
            Err(e) => return Err(e),
        };

        let conn = self.read_conn();
        let results = match vector {
            Some(v) => hybrid_search(&conn, &v, query, self.representative, self.fts)?,
            None => lexical_search(&conn, query, self.fts)?,
        };
        Ok(results)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .read_conn()
            .query_row("SELECT COUNT(*) FROM archives", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Task ids whose vectors are missing, older than `cutoff`, or from an
    /// older embedding version.
    pub fn stale_archives(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.read_conn();
        let mut stmt = conn.prepare(
            "SELECT task_id FROM archives \
             WHERE last_embedded_at IS NULL OR last_embedded_at < ?1 OR embedding_version < ?2 \
             ORDER BY last_embedded_at IS NOT NULL, last_embedded_at, task_id",
        )?;
        let ids = stmt
            .query_map(params![format_timestamp(cutoff), self.embedding_version], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Re-chunk and re-embed one archive in place. Unlike `upsert`, a missing
    /// model is an error here. Returns `false` if the id does not exist.
    pub fn refresh_embeddings(&self, task_id: &str) -> Result<bool> {
        let Some(content) = self
            .read_conn()
            .query_row(
                "SELECT content FROM archives WHERE task_id = ?1",
                [task_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        else {
            return Ok(false);
        };

        let chunks = self.embed_chunks(&content)?;

        let mut conn = self.writer.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE archives SET last_embedded_at = ?2, embedding_version = ?3 WHERE task_id = ?1",
            params![task_id, now_timestamp(), self.embedding_version],
        )?;
        if updated == 0 {
            // Deleted while we were embedding.
            return Ok(false);
        }
        replace_chunks(&tx, task_id, &chunks)?;
        tx.commit()?;
        Ok(true)
    }

    /// Chunk raw content and embed the preprocessed text of each chunk.
    /// The zero-vector sentinel counts as "model unavailable".
    fn embed_chunks(&self, content: &str) -> Result<Vec<ChunkVector>> {
        let pieces = chunk(content, self.chunk_size);
        let texts: Vec<String> = pieces
            .iter()
            .map(|c| {
                let cleaned = preprocess(&c.text);
                if cleaned.is_empty() {
                    c.text.clone()
                } else {
                    cleaned
                }
            })
            .collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        let vectors = self.embedder.embed_batch(&refs)?;
        if vectors.iter().all(|v| is_zero_vector(v)) {
            return Err(EngineError::ModelUnavailable("model is still loading".into()));
        }

        Ok(pieces
            .into_iter()
            .zip(vectors)
            .map(|(piece, vector)| ChunkVector {
                position: piece.start,
                vector,
            })
            .collect())
    }

    /// Normalize and check an input without touching the database.
    pub fn validate(&self, mut input: ArchiveInput) -> Result<ArchiveInput> {
        input.task_id = input.task_id.trim().to_string();
        validate_task_id(&input.task_id)?;

        if input.content.trim().is_empty() {
            return Err(EngineError::validation("content", "must not be empty"));
        }
        if input.content.len() > self.max_content_bytes {
            return Err(EngineError::validation(
                "content",
                format!(
                    "{} bytes exceeds the {} byte limit",
                    input.content.len(),
                    self.max_content_bytes
                ),
            ));
        }

        input.filepath = input.filepath.filter(|p| !p.trim().is_empty());
        input.title = input
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        input.completed_at = input
            .completed_at
            .filter(|c| !c.trim().is_empty())
            .map(|c| normalize_completed_at(&c))
            .transpose()?;
        Ok(input)
    }
}

impl WriteExecutor for ContentStore {
    fn execute(&self, op: &WriteOp) -> Result<WriteOutcome> {
        match op {
            WriteOp::Upsert(input) => self.upsert(input.clone()).map(WriteOutcome::Upserted),
            WriteOp::Delete { task_id } => self.delete(task_id).map(WriteOutcome::Deleted),
        }
    }
}

/// Non-empty, at most 200 chars, `[A-Za-z0-9._:/-]` only.
pub fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty() {
        return Err(EngineError::validation("task_id", "must not be empty"));
    }
    if task_id.chars().count() > MAX_TASK_ID_LEN {
        return Err(EngineError::validation(
            "task_id",
            format!("longer than {MAX_TASK_ID_LEN} characters"),
        ));
    }
    if let Some(bad) = task_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '-')))
    {
        return Err(EngineError::validation(
            "task_id",
            format!("invalid character {bad:?}"),
        ));
    }
    Ok(())
}

/// Accept RFC 3339, `YYYY-MM-DD`, or a naive `YYYY-MM-DD[T ]HH:MM:SS` (read
/// as UTC) and store canonical UTC.
pub fn normalize_completed_at(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(format_timestamp(dt.with_timezone(&Utc)));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(format_timestamp(naive.and_utc()));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(format_timestamp(midnight.and_utc()));
        }
    }
    Err(EngineError::validation(
        "completed_at",
        format!("unrecognized timestamp {raw:?}"),
    ))
}

/// First markdown heading, else the file stem, else the task id.
fn derive_title(content: &str, filepath: Option<&str>, task_id: &str) -> String {
    let heading = strip_front_matter(content).lines().find_map(|line| {
        let line = line.trim_start();
        let text = line.strip_prefix('#')?.trim_start_matches('#').trim();
        (!text.is_empty()).then(|| text.to_string())
    });
    heading
        .or_else(|| {
            filepath
                .and_then(|p| Path::new(p).file_stem())
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| task_id.to_string())
}

fn summarize(content: &str) -> Option<String> {
    let text = preprocess(content).split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return None;
    }
    Some(match text.char_indices().nth(SUMMARY_CHARS) {
        Some((end, _)) => text[..end].to_string(),
        None => text,
    })
}

fn existing(conn: &Connection, task_id: &str, hash: &str) -> rusqlite::Result<Existing> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT task_id FROM archives WHERE content_hash = ?1",
            [hash],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        Some(owner) if owner == task_id => return Ok(Existing::Same),
        Some(owner) => return Ok(Existing::OwnedBy(owner)),
        None => {}
    }

    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM archives WHERE task_id = ?1)",
        [task_id],
        |row| row.get(0),
    )?;
    Ok(if exists { Existing::Changed } else { Existing::New })
}

fn duplicate(task_id: &str, existing_task_id: String) -> EngineError {
    tracing::debug!(task_id, %existing_task_id, "duplicate content rejected");
    EngineError::DuplicateContent {
        task_id: task_id.to_string(),
        existing_task_id,
    }
}

/// Unique violations on `content_hash` or `filepath` become
/// `DuplicateContent`; anything else stays a storage error.
fn translate_conflict(
    tx: &Transaction<'_>,
    err: rusqlite::Error,
    task_id: &str,
    hash: &str,
    filepath: Option<&str>,
) -> EngineError {
    let is_unique = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    );
    if !is_unique {
        return EngineError::Storage(err);
    }

    let owner: Option<String> = tx
        .query_row(
            "SELECT task_id FROM archives WHERE (content_hash = ?1 OR filepath = ?2) AND task_id != ?3",
            params![hash, filepath, task_id],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();
    match owner {
        Some(owner) => duplicate(task_id, owner),
        None => EngineError::Storage(err),
    }
}

fn replace_chunks(tx: &Transaction<'_>, task_id: &str, chunks: &[ChunkVector]) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM embeddings WHERE task_id = ?1", [task_id])?;
    let mut stmt = tx.prepare(
        "INSERT INTO embeddings (task_id, chunk_id, position, vector) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (chunk_id, chunk) in chunks.iter().enumerate() {
        stmt.execute(params![
            task_id,
            chunk_id as i64,
            chunk.position as i64,
            embedding_to_bytes(&chunk.vector)
        ])?;
    }
    Ok(())
}

fn refresh_fts(tx: &Transaction<'_>, task_id: &str, title: &str, content: &str) -> rusqlite::Result<()> {
    tx.execute("DELETE FROM archives_fts WHERE task_id = ?1", [task_id])?;
    tx.execute(
        "INSERT INTO archives_fts (task_id, title, content) VALUES (?1, ?2, ?3)",
        params![task_id, title, content],
    )?;
    Ok(())
}

/// Stamp the configured model into `schema_meta`. Without a provider the
/// stored vectors still come from whichever model wrote them last.
fn record_model(conn: &Connection, config: &ArchivistConfig) -> anyhow::Result<()> {
    if let Some(model) = config.embedding.model_identifier() {
        db::migrations::set_embedding_model(conn, &model).context("failed to record embedding model")?;
    }
    Ok(())
}

/// Parse an enum column; values the CHECK constraints would reject are
/// conversion errors rather than silent defaults.
fn parse_column<T: std::str::FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn row_to_archive(row: &rusqlite::Row<'_>) -> rusqlite::Result<Archive> {
    let kind: String = row.get(5)?;
    let status: Option<String> = row.get(6)?;
    Ok(Archive {
        task_id: row.get(0)?,
        title: row.get(1)?,
        filepath: row.get(2)?,
        content_hash: row.get(3)?,
        content: row.get(4)?,
        kind: parse_column(5, &kind)?,
        status: status.map(|s| parse_column(6, &s)).transpose()?,
        completed_at: row.get(7)?,
        summary: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        embedding_version: row.get(11)?,
        last_embedded_at: row.get(12)?,
    })
}
