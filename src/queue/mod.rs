//! Asynchronous write queue.
//!
//! Mutations are queued per key ("lanes"): each task id has a FIFO of pending
//! operations and only its head is ever eligible to run, so writes to one key
//! apply in submission order regardless of priority. Across keys, a heap
//! orders lane heads by priority, then submission sequence. A fixed pool of
//! OS threads drains the heap.

pub mod metrics;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use uuid::Uuid;

use crate::archive::types::{ArchiveInput, UpsertOutcome};
use crate::config::QueueConfig;
use crate::error::{EngineError, Result};
pub use metrics::{HealthStatus, QueueHealth, QueueMetrics};
use metrics::{Counters, HealthThresholds};

pub type OperationId = Uuid;

/// Finished operations remembered for [`WriteQueue::operation_status`].
const RECENT_CAPACITY: usize = 1000;
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A persistence operation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Upsert(ArchiveInput),
    Delete { task_id: String },
}

impl WriteOp {
    pub fn delete(task_id: impl Into<String>) -> Self {
        Self::Delete {
            task_id: task_id.into(),
        }
    }

    /// Ordering key: the task id.
    pub fn key(&self) -> &str {
        match self {
            Self::Upsert(input) => &input.task_id,
            Self::Delete { task_id } => task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Upserted(UpsertOutcome),
    /// Whether the key existed.
    Deleted(bool),
}

/// Applies operations; implemented by the Content Store.
pub trait WriteExecutor: Send + Sync + 'static {
    fn execute(&self, op: &WriteOp) -> Result<WriteOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Return as soon as the operation is queued.
    Async,
    /// Block until the operation has run; its error is returned.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Queued,
    Running,
    Succeeded,
    Failed,
    /// Still queued when shutdown timed out.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStatus {
    pub id: OperationId,
    pub key: String,
    pub operation: &'static str,
    pub priority: Priority,
    pub state: OperationState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WriteOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// An operation that never ran because shutdown timed out.
#[derive(Debug, Clone, Serialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub key: String,
    pub operation: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every queued and in-flight operation finished before the timeout.
    pub drained: bool,
    pub succeeded: u64,
    pub failed: u64,
    pub remaining: Vec<PendingOperation>,
}

struct Job {
    id: OperationId,
    seq: u64,
    priority: Priority,
    op: WriteOp,
    reply: Option<Sender<Result<WriteOutcome>>>,
}

/// A runnable lane head. At most one entry per key is ever in the heap.
#[derive(PartialEq, Eq)]
struct Ready {
    priority: Priority,
    seq: u64,
    key: String,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    lanes: HashMap<String, VecDeque<Job>>,
    ready: BinaryHeap<Ready>,
    in_flight: HashSet<String>,
    depth: usize,
    next_seq: u64,
    accepting: bool,
    /// Workers exit once there is nothing left to run.
    stop: bool,
    counters: Counters,
    statuses: HashMap<OperationId, OperationStatus>,
    finished_order: VecDeque<OperationId>,
}

impl State {
    /// Queue the lane head for `key` if the key is idle.
    fn schedule(&mut self, key: &str) {
        if self.in_flight.contains(key) {
            return;
        }
        if let Some(head) = self.lanes.get(key).and_then(|lane| lane.front()) {
            self.ready.push(Ready {
                priority: head.priority,
                seq: head.seq,
                key: key.to_string(),
            });
        }
    }

    fn take_next(&mut self) -> Option<Job> {
        let entry = self.ready.pop()?;
        let lane = self.lanes.get_mut(&entry.key)?;
        let job = lane.pop_front()?;
        if lane.is_empty() {
            self.lanes.remove(&entry.key);
        }
        self.depth -= 1;
        self.in_flight.insert(entry.key);
        if let Some(status) = self.statuses.get_mut(&job.id) {
            status.state = OperationState::Running;
        }
        Some(job)
    }

    fn finish(&mut self, id: OperationId, state: OperationState, attempts: u32, outcome: &Result<WriteOutcome>) {
        if let Some(status) = self.statuses.get_mut(&id) {
            status.state = state;
            status.attempts = attempts;
            status.finished_at = Some(Utc::now());
            match outcome {
                Ok(o) => status.outcome = Some(*o),
                Err(e) => status.error = Some(e.to_string()),
            }
        }
        self.finished_order.push_back(id);
        while self.finished_order.len() > RECENT_CAPACITY {
            if let Some(old) = self.finished_order.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when work becomes runnable or workers should stop.
    work: Condvar,
    /// Signalled whenever an operation finishes.
    idle: Condvar,
    executor: Arc<dyn WriteExecutor>,
    max_retries: u32,
    retry_base: Duration,
}

/// Bounded priority queue drained by a worker pool.
pub struct WriteQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    max_queue_size: usize,
    depth_warning: usize,
}

impl WriteQueue {
    pub fn start(config: &QueueConfig, executor: Arc<dyn WriteExecutor>) -> Self {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                lanes: HashMap::new(),
                ready: BinaryHeap::new(),
                in_flight: HashSet::new(),
                depth: 0,
                next_seq: 0,
                accepting: true,
                stop: false,
                counters: Counters::new(),
                statuses: HashMap::new(),
                finished_order: VecDeque::new(),
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
            executor,
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = shared.clone();
            match std::thread::Builder::new()
                .name(format!("write-queue-{i}"))
                .spawn(move || worker_loop(&shared))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(worker = i, error = %e, "failed to spawn queue worker"),
            }
        }
        tracing::info!(workers = handles.len(), max_queue_size = config.max_queue_size, "write queue started");

        Self {
            shared,
            workers: Mutex::new(handles),
            worker_count,
            max_queue_size: config.max_queue_size.max(1),
            depth_warning: config.depth_warning,
        }
    }

    /// Queue an operation. In [`SubmitMode::Sync`] this blocks until the
    /// operation has run and returns its error, if any.
    pub fn submit(&self, op: WriteOp, priority: Priority, mode: SubmitMode) -> Result<OperationId> {
        match mode {
            SubmitMode::Async => self.enqueue(op, priority, None),
            SubmitMode::Sync => {
                let (tx, rx) = bounded(1);
                let id = self.enqueue(op, priority, Some(tx))?;
                match rx.recv() {
                    Ok(result) => result.map(|_| id),
                    Err(_) => Err(EngineError::ShuttingDown),
                }
            }
        }
    }

    /// Queue an operation and wait for its outcome.
    pub fn submit_and_wait(&self, op: WriteOp, priority: Priority) -> Result<WriteOutcome> {
        let (tx, rx) = bounded(1);
        self.enqueue(op, priority, Some(tx))?;
        rx.recv().map_err(|_| EngineError::ShuttingDown)?
    }

    fn enqueue(
        &self,
        op: WriteOp,
        priority: Priority,
        reply: Option<Sender<Result<WriteOutcome>>>,
    ) -> Result<OperationId> {
        let mut state = self.shared.state.lock();
        if !state.accepting {
            return Err(EngineError::ShuttingDown);
        }
        if state.depth >= self.max_queue_size {
            state.counters.rejected += 1;
            return Err(EngineError::QueueSaturated {
                depth: state.depth,
                limit: self.max_queue_size,
            });
        }

        let id = Uuid::now_v7();
        let seq = state.next_seq;
        state.next_seq += 1;
        let key = op.key().to_string();

        state.statuses.insert(
            id,
            OperationStatus {
                id,
                key: key.clone(),
                operation: op.name(),
                priority,
                state: OperationState::Queued,
                attempts: 0,
                outcome: None,
                error: None,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );

        let lane = state.lanes.entry(key.clone()).or_default();
        let was_empty = lane.is_empty();
        lane.push_back(Job {
            id,
            seq,
            priority,
            op,
            reply,
        });
        state.depth += 1;
        state.counters.submitted += 1;
        if was_empty {
            state.schedule(&key);
        }

        let depth = state.depth;
        drop(state);
        self.shared.work.notify_one();

        if depth > self.depth_warning {
            tracing::warn!(depth, threshold = self.depth_warning, "write queue depth high");
        }
        tracing::debug!(%id, key, ?priority, "write queued");
        Ok(id)
    }

    /// Stop accepting work and wait up to `timeout` for the queue to drain.
    /// Operations still queued at the deadline are cancelled and reported;
    /// workers finish whatever they are running.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        state.accepting = false;

        while state.depth > 0 || !state.in_flight.is_empty() {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let drained = state.depth == 0 && state.in_flight.is_empty();

        let mut remaining = Vec::new();
        if !drained {
            let lanes: Vec<VecDeque<Job>> = state.lanes.drain().map(|(_, lane)| lane).collect();
            state.ready.clear();
            for job in lanes.into_iter().flatten() {
                state.depth -= 1;
                let cancelled = Err(EngineError::ShuttingDown);
                state.finish(job.id, OperationState::Cancelled, 0, &cancelled);
                remaining.push(PendingOperation {
                    id: job.id,
                    key: job.op.key().to_string(),
                    operation: job.op.name(),
                });
                if let Some(reply) = job.reply {
                    let _ = reply.send(cancelled);
                }
            }
        }
        state.stop = true;
        let succeeded = state.counters.succeeded;
        let failed = state.counters.failed;
        drop(state);
        self.shared.work.notify_all();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("write queue worker panicked");
            }
        }

        if drained {
            tracing::info!(succeeded, failed, "write queue drained and stopped");
        } else {
            tracing::warn!(remaining = remaining.len(), "write queue shutdown timed out");
        }
        ShutdownReport {
            drained,
            succeeded,
            failed,
            remaining,
        }
    }

    pub fn get_metrics(&self) -> QueueMetrics {
        let state = self.shared.state.lock();
        state
            .counters
            .snapshot(state.depth, state.in_flight.len(), self.worker_count, state.accepting)
    }

    pub fn health_check(&self) -> QueueHealth {
        metrics::assess(
            self.get_metrics(),
            HealthThresholds {
                depth_warning: self.depth_warning,
                max_depth: self.max_queue_size,
            },
        )
    }

    /// Status of a queued, running or recently finished operation.
    pub fn operation_status(&self, id: OperationId) -> Option<OperationStatus> {
        self.shared.state.lock().statuses.get(&id).cloned()
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        if !self.workers.get_mut().is_empty() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.take_next() {
                    break job;
                }
                if state.stop {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };

        let key = job.op.key().to_string();
        let started = Instant::now();
        let (result, attempts, retries) = run_with_retry(shared, &job);
        let elapsed = started.elapsed();

        let state_after = if result.is_ok() {
            OperationState::Succeeded
        } else {
            OperationState::Failed
        };
        match &result {
            Ok(outcome) => tracing::debug!(id = %job.id, key, ?outcome, attempts, "write applied"),
            Err(e) if e.is_transient() => {
                tracing::error!(id = %job.id, key, attempts, error = %e, "write failed after retries")
            }
            Err(e) => tracing::warn!(id = %job.id, key, kind = e.kind(), error = %e, "write rejected"),
        }

        {
            let mut state = shared.state.lock();
            state.counters.retries += retries;
            state.counters.record_finished(elapsed, result.is_ok());
            state.finish(job.id, state_after, attempts, &result);
            state.in_flight.remove(&key);
            state.schedule(&key);
        }
        shared.work.notify_one();
        shared.idle.notify_all();

        if let Some(reply) = job.reply {
            let _ = reply.send(result);
        }
    }
}

/// Run once, then retry lock contention with exponential backoff.
fn run_with_retry(shared: &Shared, job: &Job) -> (Result<WriteOutcome>, u32, u64) {
    let mut attempts = 0u32;
    let mut retries = 0u64;
    loop {
        attempts += 1;
        match shared.executor.execute(&job.op) {
            Err(e) if e.is_transient() && attempts <= shared.max_retries => {
                let backoff = shared
                    .retry_base
                    .saturating_mul(1 << (attempts - 1).min(16))
                    .min(MAX_BACKOFF);
                tracing::warn!(id = %job.id, attempt = attempts, ?backoff, error = %e, "transient write failure, retrying");
                retries += 1;
                std::thread::sleep(backoff);
            }
            result => return (result, attempts, retries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    /// Records applied ops; optionally sleeps or fails.
    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(String, String)>>,
        delay: Duration,
        busy_failures: AtomicU32,
    }

    impl WriteExecutor for Recorder {
        fn execute(&self, op: &WriteOp) -> Result<WriteOutcome> {
            std::thread::sleep(self.delay);
            if self.busy_failures.load(AtomicOrdering::SeqCst) > 0 {
                self.busy_failures.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(EngineError::Storage(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    None,
                )));
            }
            match op {
                WriteOp::Upsert(input) => {
                    if input.content == "invalid" {
                        return Err(EngineError::validation("content", "rejected"));
                    }
                    self.applied
                        .lock()
                        .push((input.task_id.clone(), input.content.clone()));
                    Ok(WriteOutcome::Upserted(UpsertOutcome::Inserted))
                }
                WriteOp::Delete { task_id } => {
                    self.applied.lock().push((task_id.clone(), "<deleted>".into()));
                    Ok(WriteOutcome::Deleted(true))
                }
            }
        }
    }

    fn config(workers: usize) -> QueueConfig {
        QueueConfig {
            workers,
            retry_base_ms: 1,
            ..QueueConfig::default()
        }
    }

    fn upsert(id: &str, content: &str) -> WriteOp {
        WriteOp::Upsert(ArchiveInput::new(id, content))
    }

    #[test]
    fn per_key_order_survives_priorities() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(2),
            ..Default::default()
        });
        let queue = WriteQueue::start(&config(4), recorder.clone());

        let priorities = [Priority::Low, Priority::High, Priority::Normal];
        for i in 0..30 {
            for key in ["a", "b", "c"] {
                queue
                    .submit(upsert(key, &format!("{key}-{i}")), priorities[i % 3], SubmitMode::Async)
                    .unwrap();
            }
        }
        let report = queue.shutdown(Duration::from_secs(30));
        assert!(report.drained);
        assert_eq!(report.succeeded, 90);

        let applied = recorder.applied.lock();
        for key in ["a", "b", "c"] {
            let seen: Vec<_> = applied.iter().filter(|(k, _)| k == key).map(|(_, c)| c.clone()).collect();
            let expected: Vec<_> = (0..30).map(|i| format!("{key}-{i}")).collect();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn high_priority_runs_first_across_keys() {
        // One slow worker: everything after the first submit piles up.
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let queue = WriteQueue::start(&config(1), recorder.clone());

        queue.submit(upsert("first", "x"), Priority::Normal, SubmitMode::Async).unwrap();
        queue.submit(upsert("low", "x"), Priority::Low, SubmitMode::Async).unwrap();
        queue.submit(upsert("high", "x"), Priority::High, SubmitMode::Async).unwrap();
        queue.shutdown(Duration::from_secs(5));

        let applied = recorder.applied.lock();
        let pos = |k: &str| applied.iter().position(|(key, _)| key == k).unwrap();
        assert!(pos("high") < pos("low"));
    }

    #[test]
    fn sync_submit_returns_operation_error() {
        let queue = WriteQueue::start(&config(2), Arc::new(Recorder::default()));
        let err = queue
            .submit(upsert("a", "invalid"), Priority::Normal, SubmitMode::Sync)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));

        let id = queue
            .submit(upsert("a", "fine"), Priority::Normal, SubmitMode::Sync)
            .unwrap();
        let status = queue.operation_status(id).unwrap();
        assert_eq!(status.state, OperationState::Succeeded);
        assert_eq!(status.outcome, Some(WriteOutcome::Upserted(UpsertOutcome::Inserted)));
    }

    #[test]
    fn transient_failures_are_retried() {
        let recorder = Arc::new(Recorder {
            busy_failures: AtomicU32::new(2),
            ..Default::default()
        });
        let queue = WriteQueue::start(&config(1), recorder.clone());
        let outcome = queue.submit_and_wait(upsert("a", "x"), Priority::Normal).unwrap();
        assert_eq!(outcome, WriteOutcome::Upserted(UpsertOutcome::Inserted));
        assert_eq!(queue.get_metrics().retries, 2);
    }

    #[test]
    fn retries_are_bounded() {
        let recorder = Arc::new(Recorder {
            busy_failures: AtomicU32::new(100),
            ..Default::default()
        });
        let queue = WriteQueue::start(&config(1), recorder);
        let err = queue.submit_and_wait(upsert("a", "x"), Priority::Normal).unwrap_err();
        assert!(err.is_transient());
        let metrics = queue.get_metrics();
        assert_eq!(metrics.retries, 3);
        assert_eq!(metrics.failed, 1);
    }

    #[test]
    fn saturated_queue_rejects() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let queue = WriteQueue::start(
            &QueueConfig {
                workers: 1,
                max_queue_size: 2,
                ..QueueConfig::default()
            },
            recorder,
        );
        let mut rejected = 0;
        for i in 0..6 {
            if let Err(EngineError::QueueSaturated { limit, .. }) =
                queue.submit(upsert(&format!("k{i}"), "x"), Priority::Normal, SubmitMode::Async)
            {
                assert_eq!(limit, 2);
                rejected += 1;
            }
        }
        assert!(rejected >= 3);
        assert_eq!(queue.get_metrics().rejected, rejected);
    }

    #[test]
    fn shutdown_timeout_reports_remaining() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let queue = WriteQueue::start(&config(1), recorder);
        let ids: Vec<_> = (0..5)
            .map(|i| {
                queue
                    .submit(upsert(&format!("k{i}"), "x"), Priority::Normal, SubmitMode::Async)
                    .unwrap()
            })
            .collect();

        let report = queue.shutdown(Duration::from_millis(50));
        assert!(!report.drained);
        assert!(!report.remaining.is_empty());
        let last = queue.operation_status(ids[4]).unwrap();
        assert_eq!(last.state, OperationState::Cancelled);

        assert!(matches!(
            queue.submit(upsert("late", "x"), Priority::Normal, SubmitMode::Async),
            Err(EngineError::ShuttingDown)
        ));
        // Idempotent.
        assert!(queue.shutdown(Duration::from_millis(10)).drained);
    }

    #[test]
    fn health_reflects_shutdown() {
        let queue = WriteQueue::start(&config(1), Arc::new(Recorder::default()));
        assert_eq!(queue.health_check().status, HealthStatus::Healthy);
        queue.shutdown(Duration::from_secs(1));
        let health = queue.health_check();
        assert!(health.score <= 50);
        assert!(!health.issues.is_empty());
    }
}
