//! Bulk directory indexer.
//!
//! Walks directories, turns each matching file into an [`ArchiveInput`]
//! (deriving its task id and kind from the path, markdown front matter, and
//! for source files a verbatim or structural rendering), and writes it
//! through the write queue or directly into the store. Files are processed on
//! a dedicated rayon pool; a failing file is counted and logged but never
//! stops the scan.

pub mod extract;
pub mod ids;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use walkdir::WalkDir;

use crate::archive::chunk::front_matter_split;
use crate::archive::store::{normalize_completed_at, validate_task_id, ContentStore};
use crate::archive::types::{ArchiveInput, ArchiveKind, ArchiveStatus, UpsertOutcome};
use crate::config::{expand_tilde, IndexerConfig};
use crate::error::{EngineError, Result};
use crate::queue::{Priority, WriteOp, WriteOutcome, WriteQueue};
use ids::FileCategory;

/// Build output, dependency and test-artifact directories.
const SKIP_DIRS: &[&str] = &[
    ".git", ".hg", ".svn", "node_modules", "target", "build", "dist", "out", ".next", ".nuxt",
    "__pycache__", ".venv", "venv", ".tox", ".mypy_cache", ".pytest_cache", ".cache", "coverage",
    "htmlcov", ".nyc_output", "test-results", "__snapshots__", "vendor", ".idea", ".vscode",
];
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "mdc", "markdown"];
const PROGRESS_INTERVAL: usize = 50;
const MAX_REPORTED_ERRORS: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub found: usize,
    pub indexed: usize,
    /// Unchanged files, duplicates of other archives, and empty files.
    pub skipped: usize,
    pub failed: usize,
    /// `path: error` for the first failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub processed: usize,
    pub total: usize,
    pub files_per_sec: f64,
    /// `None` until throughput is measurable.
    pub eta: Option<Duration>,
}

impl ScanProgress {
    fn new(processed: usize, total: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let files_per_sec = if secs > 0.0 { processed as f64 / secs } else { 0.0 };
        let eta = (files_per_sec > 0.0)
            .then(|| Duration::from_secs_f64(total.saturating_sub(processed) as f64 / files_per_sec));
        Self {
            processed,
            total,
            files_per_sec,
            eta,
        }
    }
}

pub type ProgressCallback<'a> = &'a (dyn Fn(&ScanProgress) + Send + Sync);

enum FileOutcome {
    Indexed,
    Skipped,
    Failed(String),
}

pub struct Indexer {
    store: Arc<ContentStore>,
    queue: Option<Arc<WriteQueue>>,
    directories: Vec<PathBuf>,
    extensions: HashSet<String>,
    code_size_threshold: usize,
    pool: rayon::ThreadPool,
}

impl Indexer {
    /// Writes go through `queue` in synchronous mode when given, so each
    /// file's result is known; otherwise straight to the store.
    pub fn new(
        config: &IndexerConfig,
        store: Arc<ContentStore>,
        queue: Option<Arc<WriteQueue>>,
    ) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("indexer-{i}"))
            .build()
            .context("failed to build indexer thread pool")?;
        Ok(Self {
            store,
            queue,
            directories: config.directories.iter().map(|d| expand_tilde(d)).collect(),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            code_size_threshold: config.code_size_threshold,
            pool,
        })
    }

    pub fn scan(&self, directories: &[PathBuf], force_reindex: bool) -> Result<ScanStats> {
        self.scan_with_progress(directories, force_reindex, None)
    }

    /// Scan `directories` (the configured ones when empty).
    pub fn scan_with_progress(
        &self,
        directories: &[PathBuf],
        force_reindex: bool,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<ScanStats> {
        let directories = if directories.is_empty() {
            &self.directories[..]
        } else {
            directories
        };
        if directories.is_empty() {
            return Err(EngineError::validation("directories", "no directories to scan"));
        }

        let started = Instant::now();
        let files = self.discover(directories);
        let total = files.len();
        tracing::info!(files = total, force_reindex, "scan started");

        let processed = AtomicUsize::new(0);
        let indexed = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let errors = Mutex::new(Vec::new());

        self.pool.install(|| {
            files.par_iter().for_each(|(root, path)| {
                match self.process_file(root, path, force_reindex) {
                    FileOutcome::Indexed => {
                        indexed.fetch_add(1, Ordering::Relaxed);
                    }
                    FileOutcome::Skipped => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    FileOutcome::Failed(error) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(path = %path.display(), error = %error, "failed to index file");
                        let mut errors = errors.lock();
                        if errors.len() < MAX_REPORTED_ERRORS {
                            errors.push(format!("{}: {error}", path.display()));
                        }
                    }
                }

                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % PROGRESS_INTERVAL == 0 || done == total {
                    let progress = ScanProgress::new(done, total, started.elapsed());
                    tracing::info!(
                        processed = progress.processed,
                        total = progress.total,
                        files_per_sec = progress.files_per_sec,
                        eta = ?progress.eta,
                        "scan progress"
                    );
                    if let Some(callback) = on_progress {
                        callback(&progress);
                    }
                }
            });
        });

        let stats = ScanStats {
            found: total,
            indexed: indexed.into_inner(),
            skipped: skipped.into_inner(),
            failed: failed.into_inner(),
            errors: errors.into_inner(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            found = stats.found,
            indexed = stats.indexed,
            skipped = stats.skipped,
            failed = stats.failed,
            elapsed_secs = stats.elapsed_secs,
            "scan finished"
        );
        Ok(stats)
    }

    /// Matching files as `(scan root, path)` pairs, sorted for a stable order.
    fn discover(&self, directories: &[PathBuf]) -> Vec<(PathBuf, PathBuf)> {
        let mut files = Vec::new();
        for root in directories {
            if !root.is_dir() {
                tracing::warn!(directory = %root.display(), "scan directory does not exist");
                continue;
            }
            let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
                !(entry.depth() > 0
                    && entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| SKIP_DIRS.contains(&name)))
            });
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                if entry.file_type().is_file() && self.matches_extension(entry.path()) {
                    files.push((root.clone(), entry.into_path()));
                }
            }
        }
        files.sort_by(|a, b| a.1.cmp(&b.1));
        files.dedup_by(|a, b| a.1 == b.1);
        files
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_ascii_lowercase()))
    }

    fn process_file(&self, root: &Path, path: &Path, force_reindex: bool) -> FileOutcome {
        let input = match self.prepare(root, path, force_reindex) {
            Ok(Some(input)) => input,
            Ok(None) => return FileOutcome::Skipped,
            Err(e) => return FileOutcome::Failed(format!("{e:#}")),
        };
        let task_id = input.task_id.clone();

        match self.write(input) {
            Ok(UpsertOutcome::Inserted | UpsertOutcome::Updated) => {
                tracing::debug!(task_id = %task_id, path = %path.display(), "indexed");
                FileOutcome::Indexed
            }
            Ok(UpsertOutcome::Unchanged) => FileOutcome::Skipped,
            Err(EngineError::DuplicateContent { existing_task_id, .. }) => {
                tracing::debug!(
                    task_id = %task_id,
                    existing_task_id = %existing_task_id,
                    "duplicate content, skipped"
                );
                FileOutcome::Skipped
            }
            Err(e) => FileOutcome::Failed(e.to_string()),
        }
    }

    fn write(&self, input: ArchiveInput) -> Result<UpsertOutcome> {
        let Some(queue) = &self.queue else {
            return self.store.upsert(input);
        };
        match queue.submit_and_wait(WriteOp::Upsert(input), Priority::Low)? {
            WriteOutcome::Upserted(outcome) => Ok(outcome),
            other => Err(EngineError::Internal(anyhow::anyhow!(
                "unexpected queue outcome for upsert: {other:?}"
            ))),
        }
    }

    /// Build the upsert for one file; `None` for files with no content.
    fn prepare(&self, root: &Path, path: &Path, force_reindex: bool) -> anyhow::Result<Option<ArchiveInput>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if content.trim().is_empty() {
            return Ok(None);
        }

        let rel = path.strip_prefix(root).unwrap_or(path);
        let category = FileCategory::classify(rel);
        let is_markdown = rel
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| MARKDOWN_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        let meta = if is_markdown {
            FrontMatter::parse(&content, path)
        } else {
            FrontMatter::default()
        };

        let task_id = meta
            .task_id
            .clone()
            .unwrap_or_else(|| ids::derive_task_id(rel, category));
        let kind = meta.kind.unwrap_or_else(|| ids::infer_kind(rel, category));
        let body = match category {
            FileCategory::Code => extract::code_document(rel, &content, self.code_size_threshold),
            _ => content,
        };

        let mut input = ArchiveInput::new(task_id, body)
            .with_filepath(path.to_string_lossy())
            .with_kind(kind);
        if let Some(title) = meta.title {
            input = input.with_title(title);
        }
        if let Some(status) = meta.status {
            input = input.with_status(status);
        }
        if let Some(completed_at) = meta.completed_at {
            input = input.with_completed_at(completed_at);
        }
        if force_reindex {
            input = input.forced();
        }
        Ok(Some(input))
    }
}

/// Recognized front-matter keys. Values that fail to parse are dropped with
/// a warning rather than failing the file.
#[derive(Debug, Default)]
struct FrontMatter {
    task_id: Option<String>,
    title: Option<String>,
    status: Option<ArchiveStatus>,
    kind: Option<ArchiveKind>,
    completed_at: Option<String>,
}

impl FrontMatter {
    fn parse(content: &str, path: &Path) -> Self {
        let mut meta = Self::default();
        let Some((block, _)) = front_matter_split(content) else {
            return meta;
        };

        for line in block.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().trim_matches(['"', '\'']).trim();
            if value.is_empty() {
                continue;
            }
            let key = key.trim().to_ascii_lowercase();
            match key.as_str() {
                "task_id" | "id" => match validate_task_id(value) {
                    Ok(()) => meta.task_id = Some(value.to_string()),
                    Err(e) => warn_field(path, &key, &e.to_string()),
                },
                "title" => meta.title = Some(value.to_string()),
                "status" => match value.parse() {
                    Ok(status) => meta.status = Some(status),
                    Err(e) => warn_field(path, &key, &e),
                },
                "kind" | "type" => match value.to_ascii_lowercase().parse() {
                    Ok(kind) => meta.kind = Some(kind),
                    Err(e) => warn_field(path, &key, &e),
                },
                "completed" | "completed_at" => match normalize_completed_at(value) {
                    Ok(ts) => meta.completed_at = Some(ts),
                    Err(e) => warn_field(path, &key, &e.to_string()),
                },
                _ => {}
            }
        }
        meta
    }
}

fn warn_field(path: &Path, key: &str, error: &str) {
    tracing::warn!(path = %path.display(), key, error, "ignoring front matter field");
}
