//! Top-level context owning every service.
//!
//! [`Engine`] is what the HTTP layer, a file watcher or the CLI holds. It
//! wires the embedding service, content store, write queue, maintenance
//! daemon and indexer together from one resolved [`ArchivistConfig`]. There
//! are no process-wide singletons; tests build as many engines as they like.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::archive::search::SearchQuery;
use crate::archive::store::ContentStore;
use crate::archive::types::{Archive, ArchiveInput, ArchiveKind, SearchResult};
use crate::config::ArchivistConfig;
use crate::embedding::create_loader;
use crate::embedding::service::{EmbeddingService, EmbeddingStats};
use crate::error::Result;
use crate::indexer::{Indexer, ProgressCallback, ScanStats};
use crate::maintenance::{
    MaintenanceDaemon, MaintenanceOp, MaintenanceStatus, OperationReport, ReembedReport,
};
use crate::queue::{
    OperationId, OperationStatus, Priority, QueueHealth, QueueMetrics, ShutdownReport, SubmitMode,
    WriteOp, WriteOutcome, WriteQueue,
};

const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a mutation submitted through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteReceipt {
    /// The write ran before the call returned.
    Applied(WriteOutcome),
    /// The write was queued; poll [`Engine::operation_status`].
    Queued(OperationId),
}

pub struct Engine {
    config: ArchivistConfig,
    embedder: Arc<EmbeddingService>,
    store: Arc<ContentStore>,
    queue: Arc<WriteQueue>,
    daemon: Arc<MaintenanceDaemon>,
    indexer: Indexer,
    shut_down: AtomicBool,
}

impl Engine {
    /// Open the on-disk database and start the background services.
    pub fn open(config: ArchivistConfig) -> Result<Self> {
        let embedder = EmbeddingService::new(&config.embedding, create_loader(&config.embedding)?);
        let store = Arc::new(ContentStore::open(&config, Arc::clone(&embedder))?);
        Self::assemble(config, embedder, store)
    }

    /// Engine over an in-memory database. Nothing survives the process.
    pub fn open_in_memory(config: ArchivistConfig) -> Result<Self> {
        let embedder = EmbeddingService::new(&config.embedding, create_loader(&config.embedding)?);
        let store = Arc::new(ContentStore::open_in_memory(&config, Arc::clone(&embedder))?);
        Self::assemble(config, embedder, store)
    }

    fn assemble(
        config: ArchivistConfig,
        embedder: Arc<EmbeddingService>,
        store: Arc<ContentStore>,
    ) -> Result<Self> {
        let queue = Arc::new(WriteQueue::start(&config.queue, store.clone()));
        let daemon = MaintenanceDaemon::new(&config, Arc::clone(&store))?;
        if config.maintenance.enabled {
            daemon.start()?;
        }
        let indexer = Indexer::new(&config.indexer, Arc::clone(&store), Some(Arc::clone(&queue)))?;

        tracing::info!(
            async_writes = config.queue.async_writes,
            maintenance = config.maintenance.enabled,
            embedding = embedder.is_enabled(),
            "engine ready"
        );
        Ok(Self {
            config,
            embedder,
            store,
            queue,
            daemon,
            indexer,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ArchivistConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Insert or replace an archive, queued or applied according to
    /// `queue.async_writes`.
    pub fn upsert(&self, input: ArchiveInput) -> Result<WriteReceipt> {
        self.upsert_with(input, Priority::Normal, self.default_mode())
    }

    /// Upsert with an explicit priority and mode. Input is validated before
    /// it is queued, so a queued write never fails validation later.
    pub fn upsert_with(
        &self,
        input: ArchiveInput,
        priority: Priority,
        mode: SubmitMode,
    ) -> Result<WriteReceipt> {
        let input = self.store.validate(input)?;
        self.submit(WriteOp::Upsert(input), priority, mode)
    }

    pub fn delete(&self, task_id: &str) -> Result<WriteReceipt> {
        self.delete_with(task_id, Priority::Normal, self.default_mode())
    }

    pub fn delete_with(&self, task_id: &str, priority: Priority, mode: SubmitMode) -> Result<WriteReceipt> {
        crate::archive::store::validate_task_id(task_id)?;
        self.submit(WriteOp::delete(task_id), priority, mode)
    }

    fn submit(&self, op: WriteOp, priority: Priority, mode: SubmitMode) -> Result<WriteReceipt> {
        match mode {
            SubmitMode::Async => self.queue.submit(op, priority, mode).map(WriteReceipt::Queued),
            SubmitMode::Sync => self
                .queue
                .submit_and_wait(op, priority)
                .map(WriteReceipt::Applied),
        }
    }

    fn default_mode(&self) -> SubmitMode {
        if self.config.queue.async_writes {
            SubmitMode::Async
        } else {
            SubmitMode::Sync
        }
    }

    pub fn operation_status(&self, id: OperationId) -> Option<OperationStatus> {
        self.queue.operation_status(id)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get(&self, task_id: &str) -> Result<Option<Archive>> {
        self.store.get(task_id)
    }

    pub fn list_latest(&self, n: usize, kind: Option<ArchiveKind>) -> Result<Vec<Archive>> {
        self.store.list_latest(n, kind)
    }

    /// A query pre-filled with the configured `k` and minimum score.
    pub fn query(&self, text: impl Into<String>) -> SearchQuery {
        SearchQuery::new(text, self.config.search.default_k).with_min_score(self.config.search.min_score)
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        self.store.search(query)
    }

    // ── Observability ────────────────────────────────────────────────────────

    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.get_metrics()
    }

    pub fn queue_health(&self) -> QueueHealth {
        self.queue.health_check()
    }

    pub fn embedding_stats(&self) -> EmbeddingStats {
        self.embedder.stats()
    }

    /// Start loading the embedding model without waiting for it.
    pub fn preload_model(&self) {
        self.embedder.preload_background();
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    pub fn maintenance_status(&self) -> Result<MaintenanceStatus> {
        self.daemon.status()
    }

    /// Run one maintenance operation now, outside the schedule.
    pub fn trigger_maintenance(&self, op: MaintenanceOp) -> OperationReport {
        self.daemon.run_operation(op)
    }

    pub fn reembed(&self, stale_after: Option<Duration>, dry_run: bool) -> Result<ReembedReport> {
        self.daemon.reembed(stale_after, dry_run)
    }

    // ── Indexing ─────────────────────────────────────────────────────────────

    /// Index `directories`, or the configured ones when empty.
    pub fn scan(&self, directories: &[PathBuf], force_reindex: bool) -> Result<ScanStats> {
        self.indexer.scan(directories, force_reindex)
    }

    pub fn scan_with_progress(
        &self,
        directories: &[PathBuf],
        force_reindex: bool,
        on_progress: ProgressCallback<'_>,
    ) -> Result<ScanStats> {
        self.indexer
            .scan_with_progress(directories, force_reindex, Some(on_progress))
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Stop the daemon, drain the write queue for up to `timeout`, and cancel
    /// the model's idle timer. Later calls return an empty report.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return self.queue.shutdown(Duration::ZERO);
        }
        tracing::info!(timeout_secs = timeout.as_secs_f64(), "engine shutting down");
        self.daemon.stop();
        let report = self.queue.shutdown(timeout);
        self.embedder.cancel_cleanup();
        report
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.shutdown(DROP_SHUTDOWN_TIMEOUT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::types::UpsertOutcome;
    use crate::error::EngineError;

    fn config(async_writes: bool) -> ArchivistConfig {
        let mut config = ArchivistConfig::default();
        config.embedding.provider = "hashing".into();
        config.embedding.disable_cleanup = true;
        config.maintenance.enabled = false;
        config.queue.async_writes = async_writes;
        config
    }

    #[test]
    fn test_sync_upsert_reports_outcome() {
        let engine = Engine::open_in_memory(config(false)).unwrap();
        let receipt = engine.upsert(ArchiveInput::new("t-1", "hello world")).unwrap();
        assert_eq!(receipt, WriteReceipt::Applied(WriteOutcome::Upserted(UpsertOutcome::Inserted)));
        assert!(engine.get("t-1").unwrap().is_some());
    }

    #[test]
    fn test_async_upsert_is_applied_after_shutdown() {
        let engine = Engine::open_in_memory(config(true)).unwrap();
        let receipt = engine.upsert(ArchiveInput::new("t-1", "queued content")).unwrap();
        assert!(matches!(receipt, WriteReceipt::Queued(_)));

        let report = engine.shutdown(Duration::from_secs(10));
        assert!(report.drained);
        assert_eq!(engine.get("t-1").unwrap().unwrap().content, "queued content");
    }

    #[test]
    fn test_async_validation_is_immediate() {
        let engine = Engine::open_in_memory(config(true)).unwrap();
        let err = engine.upsert(ArchiveInput::new("bad id", "x")).unwrap_err();
        assert!(matches!(err, EngineError::Validation { field: "task_id", .. }));
        assert_eq!(engine.queue_metrics().total_submitted, 0);
    }

    #[test]
    fn test_writes_after_shutdown_are_refused() {
        let engine = Engine::open_in_memory(config(false)).unwrap();
        engine.shutdown(Duration::from_secs(1));
        let err = engine.upsert(ArchiveInput::new("t-1", "late")).unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
        // Second shutdown is a no-op.
        assert!(engine.shutdown(Duration::from_secs(1)).drained);
    }

    #[test]
    fn test_query_uses_configured_defaults() {
        let mut cfg = config(false);
        cfg.search.default_k = 7;
        cfg.search.min_score = 0.25;
        let engine = Engine::open_in_memory(cfg).unwrap();
        let query = engine.query("jwt");
        assert_eq!(query.k, 7);
        assert!((query.min_score - 0.25).abs() < 1e-6);
    }
}
