//! Lifecycle manager for the embedding model.
//!
//! The model is expensive to hold, so [`EmbeddingService`] loads it lazily,
//! shares one instance across threads, and unloads it after an idle period.
//!
//! State machine: `Unloaded → Loading → Ready`, `Ready → Unloaded` on idle,
//! `Loading → Failed` when every device rejects the model. Only one thread
//! ever runs a load; everyone else waits on the same condition variable.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};

use super::{BackendLoader, Device, EmbeddingBackend, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;
use crate::error::{EngineError, Result};

/// Sample process memory every N batches (sysinfo refreshes are not free).
const MEMORY_SAMPLE_EVERY: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    /// The last load attempt failed on every device.
    Failed,
}

/// Usage counters exposed for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingStats {
    pub requests: u64,
    pub batches: u64,
    pub texts: u64,
    pub total_processing_ms: u64,
    pub peak_memory_bytes: u64,
    pub loads: u64,
    pub unloads: u64,
    pub load_failures: u64,
    pub device: Option<Device>,
    pub state: Option<ModelState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct Slot {
    state: ModelState,
    backend: Option<Arc<dyn EmbeddingBackend>>,
    last_used: Instant,
    /// Incremented whenever a load finishes, successful or not.
    load_generation: u64,
    last_error: Option<String>,
    failed_at: Option<Instant>,
}

impl Slot {
    /// A failed load is not retried implicitly until the cooldown passes.
    fn cooling_down(&self, cooldown: Duration) -> bool {
        self.state == ModelState::Failed && self.failed_at.is_some_and(|at| at.elapsed() < cooldown)
    }
}

struct CleanupTimer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Thread-safe, lazily-loaded embedding model.
pub struct EmbeddingService {
    this: Weak<EmbeddingService>,
    loader: Option<BackendLoader>,
    devices: Vec<Device>,
    batch_size: usize,
    idle_timeout: Option<Duration>,
    load_timeout: Duration,
    retry_cooldown: Duration,
    slot: Mutex<Slot>,
    ready: Condvar,
    stats: Mutex<EmbeddingStats>,
    cleanup: Mutex<Option<CleanupTimer>>,
}

impl EmbeddingService {
    /// Build a service from config. No model is loaded until first use.
    pub fn new(config: &EmbeddingConfig, loader: Option<BackendLoader>) -> Arc<Self> {
        let device_override = config.device.as_deref().and_then(|d| match d.parse::<Device>() {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring device override");
                None
            }
        });
        let idle_timeout = (!config.disable_cleanup && config.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(config.idle_timeout_secs));

        let service = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            loader,
            devices: Device::preference_order(device_override),
            batch_size: config.batch_size.max(1),
            idle_timeout,
            load_timeout: Duration::from_secs(config.load_timeout_secs),
            retry_cooldown: Duration::from_secs(config.retry_cooldown_secs),
            slot: Mutex::new(Slot {
                state: ModelState::Unloaded,
                backend: None,
                last_used: Instant::now(),
                load_generation: 0,
                last_error: None,
                failed_at: None,
            }),
            ready: Condvar::new(),
            stats: Mutex::new(EmbeddingStats::default()),
            cleanup: Mutex::new(None),
        });

        if let Some(timeout) = idle_timeout {
            service.start_cleanup_timer(timeout);
        }
        service
    }

    /// Whether a backend exists at all (provider not `disabled`).
    pub fn is_enabled(&self) -> bool {
        self.loader.is_some()
    }

    pub fn state(&self) -> ModelState {
        self.slot.lock().state
    }

    pub fn dimensions(&self) -> usize {
        self.slot
            .lock()
            .backend
            .as_ref()
            .map(|b| b.dimensions())
            .unwrap_or(EMBEDDING_DIM)
    }

    /// The backend if it is loaded right now. Never blocks on a load.
    pub fn try_get(&self) -> Option<Arc<dyn EmbeddingBackend>> {
        let slot = self.slot.lock();
        match slot.state {
            ModelState::Ready => slot.backend.clone(),
            _ => None,
        }
    }

    /// Block until the model is ready, loading it if needed. Concurrent
    /// callers share one load.
    pub fn ensure_ready(&self) -> Result<Arc<dyn EmbeddingBackend>> {
        if self.loader.is_none() {
            return Err(EngineError::ModelUnavailable("embeddings are disabled".into()));
        }

        let mut slot = self.slot.lock();
        let mut observed_generation: Option<u64> = None;
        loop {
            match slot.state {
                ModelState::Ready => {
                    if let Some(backend) = slot.backend.clone() {
                        return Ok(backend);
                    }
                    slot.state = ModelState::Unloaded;
                }
                ModelState::Loading => {
                    observed_generation.get_or_insert(slot.load_generation);
                    self.ready.wait(&mut slot);
                }
                ModelState::Failed
                    if observed_generation.is_some_and(|g| g != slot.load_generation) =>
                {
                    // We waited on somebody else's load and it failed.
                    let reason = slot.last_error.clone().unwrap_or_default();
                    return Err(EngineError::ModelUnavailable(reason));
                }
                ModelState::Failed if slot.cooling_down(self.retry_cooldown) => {
                    let reason = slot.last_error.clone().unwrap_or_default();
                    return Err(EngineError::ModelUnavailable(reason));
                }
                ModelState::Unloaded | ModelState::Failed => {
                    slot.state = ModelState::Loading;
                    break;
                }
            }
        }
        drop(slot);

        self.finish_load(self.load_backend())
    }

    /// Explicit load request. Waits up to the configured load timeout for an
    /// in-flight background load, then loads inline. Any failure is returned.
    pub fn force_load(&self) -> Result<Arc<dyn EmbeddingBackend>> {
        if self.loader.is_none() {
            return Err(EngineError::ModelUnavailable("embeddings are disabled".into()));
        }

        let mut slot = self.slot.lock();
        if slot.state == ModelState::Loading {
            let deadline = Instant::now() + self.load_timeout;
            while slot.state == ModelState::Loading {
                if self.ready.wait_until(&mut slot, deadline).timed_out() {
                    break;
                }
            }
        }

        match slot.state {
            ModelState::Ready => {
                if let Some(backend) = slot.backend.clone() {
                    return Ok(backend);
                }
            }
            ModelState::Loading => {
                tracing::warn!(
                    timeout_secs = self.load_timeout.as_secs(),
                    "background model load still running, loading inline"
                );
            }
            ModelState::Unloaded | ModelState::Failed => {}
        }
        slot.state = ModelState::Loading;
        drop(slot);

        self.finish_load(self.load_backend())
    }

    /// Start loading on a background thread and return immediately.
    pub fn preload_background(&self) {
        if self.loader.is_none() {
            return;
        }
        {
            let mut slot = self.slot.lock();
            if !matches!(slot.state, ModelState::Unloaded | ModelState::Failed)
                || slot.cooling_down(self.retry_cooldown)
            {
                return;
            }
            slot.state = ModelState::Loading;
        }

        let Some(service) = self.this.upgrade() else {
            return;
        };
        let spawned = std::thread::Builder::new()
            .name("embedding-loader".into())
            .spawn(move || {
                let result = service.load_backend();
                if let Err(e) = service.finish_load(result) {
                    tracing::warn!(error = %e, "background model load failed");
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn model loader thread");
            self.finish_load(Err(EngineError::ModelUnavailable(e.to_string())))
                .ok();
        }
    }

    /// Embed one text. See [`embed_batch`](Self::embed_batch).
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text])?;
        Ok(vectors.pop().unwrap_or_else(|| vec![0.0; self.dimensions()]))
    }

    /// Embed many texts, in `batch_size` slices.
    ///
    /// On a single-threaded tokio runtime the call never blocks on a load: it
    /// kicks one off in the background and returns zero vectors until the
    /// model is ready.
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let backend = match self.try_get() {
            Some(backend) => backend,
            None if on_current_thread_runtime() => {
                self.preload_background();
                tracing::debug!("model not ready on cooperative runtime, returning sentinel");
                return Ok(vec![vec![0.0; self.dimensions()]; texts.len()]);
            }
            None => self.ensure_ready()?,
        };

        let started = Instant::now();
        let mut vectors = Vec::with_capacity(texts.len());
        let mut batches = 0u64;
        for batch in texts.chunks(self.batch_size) {
            let out = backend
                .embed_batch(batch)
                .map_err(|e| EngineError::ModelUnavailable(format!("inference failed: {e:#}")))?;
            vectors.extend(out);
            batches += 1;
        }
        let elapsed = started.elapsed();

        self.slot.lock().last_used = Instant::now();

        let sample_memory = {
            let mut stats = self.stats.lock();
            stats.requests += 1;
            let before = stats.batches;
            stats.batches += batches;
            stats.texts += texts.len() as u64;
            stats.total_processing_ms += elapsed.as_millis() as u64;
            before / MEMORY_SAMPLE_EVERY != stats.batches / MEMORY_SAMPLE_EVERY
        };
        if sample_memory {
            self.record_memory();
        }

        Ok(vectors)
    }

    /// Drop the model now. In-flight calls keep their handle until done.
    pub fn unload(&self) -> bool {
        let mut slot = self.slot.lock();
        if slot.state != ModelState::Ready {
            return false;
        }
        slot.backend = None;
        slot.state = ModelState::Unloaded;
        drop(slot);

        self.stats.lock().unloads += 1;
        tracing::info!("embedding model unloaded");
        true
    }

    /// Unload if the model has been unused for the idle timeout.
    pub fn unload_if_idle(&self) -> bool {
        let Some(timeout) = self.idle_timeout else {
            return false;
        };
        let idle = {
            let slot = self.slot.lock();
            slot.state == ModelState::Ready && slot.last_used.elapsed() >= timeout
        };
        idle && self.unload()
    }

    /// Stop the idle-cleanup timer. Safe from any thread, any number of times.
    pub fn cancel_cleanup(&self) {
        let timer = self.cleanup.lock().take();
        if let Some(timer) = timer {
            drop(timer.stop);
            if timer.handle.thread().id() != std::thread::current().id() {
                let _ = timer.handle.join();
            }
        }
    }

    pub fn stats(&self) -> EmbeddingStats {
        let mut stats = self.stats.lock().clone();
        let slot = self.slot.lock();
        stats.state = Some(slot.state);
        stats.last_error = slot.last_error.clone();
        stats
    }

    /// Try every device in order. CPU rejection is the final error.
    fn load_backend(&self) -> Result<Arc<dyn EmbeddingBackend>> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| EngineError::ModelUnavailable("embeddings are disabled".into()))?;

        let started = Instant::now();
        let mut last_error = None;
        for &device in &self.devices {
            match loader(device) {
                Ok(backend) => {
                    tracing::info!(
                        %device,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "embedding model ready"
                    );
                    return Ok(Arc::from(backend));
                }
                Err(e) => {
                    tracing::warn!(%device, error = %format!("{e:#}"), "device rejected embedding model");
                    last_error = Some(format!("{device}: {e:#}"));
                }
            }
        }
        Err(EngineError::ModelUnavailable(
            last_error.unwrap_or_else(|| "no devices configured".into()),
        ))
    }

    fn finish_load(
        &self,
        result: Result<Arc<dyn EmbeddingBackend>>,
    ) -> Result<Arc<dyn EmbeddingBackend>> {
        let mut slot = self.slot.lock();
        slot.load_generation += 1;
        let outcome = match result {
            Ok(backend) => {
                let device = backend.device();
                slot.backend = Some(backend.clone());
                slot.state = ModelState::Ready;
                slot.last_used = Instant::now();
                slot.last_error = None;
                slot.failed_at = None;
                let mut stats = self.stats.lock();
                stats.loads += 1;
                stats.device = Some(device);
                Ok(backend)
            }
            Err(e) => {
                slot.backend = None;
                slot.state = ModelState::Failed;
                slot.last_error = Some(e.to_string());
                slot.failed_at = Some(Instant::now());
                self.stats.lock().load_failures += 1;
                Err(e)
            }
        };
        drop(slot);
        self.ready.notify_all();

        if outcome.is_ok() {
            self.record_memory();
        }
        outcome
    }

    fn record_memory(&self) {
        let rss = current_rss_bytes();
        let mut stats = self.stats.lock();
        stats.peak_memory_bytes = stats.peak_memory_bytes.max(rss);
    }

    fn start_cleanup_timer(&self, timeout: Duration) {
        let (stop, stop_rx) = bounded::<()>(0);
        let this = self.this.clone();
        let spawned = std::thread::Builder::new()
            .name("embedding-idle".into())
            .spawn(move || loop {
                let wait = match this.upgrade() {
                    Some(service) => service.time_until_idle(timeout),
                    None => return,
                };
                match stop_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => match this.upgrade() {
                        Some(service) => {
                            service.unload_if_idle();
                        }
                        None => return,
                    },
                    _ => return,
                }
            });

        match spawned {
            Ok(handle) => *self.cleanup.lock() = Some(CleanupTimer { stop, handle }),
            Err(e) => tracing::error!(error = %e, "failed to start idle-cleanup timer"),
        }
    }

    fn time_until_idle(&self, timeout: Duration) -> Duration {
        let slot = self.slot.lock();
        match slot.state {
            ModelState::Ready => timeout
                .saturating_sub(slot.last_used.elapsed())
                .max(Duration::from_millis(10)),
            _ => timeout,
        }
    }
}

impl Drop for EmbeddingService {
    fn drop(&mut self) {
        // The timer only holds a Weak, so closing the channel is enough.
        if let Some(timer) = self.cleanup.get_mut().take() {
            drop(timer.stop);
        }
    }
}

fn on_current_thread_runtime() -> bool {
    tokio::runtime::Handle::try_current()
        .map(|h| matches!(h.runtime_flavor(), tokio::runtime::RuntimeFlavor::CurrentThread))
        .unwrap_or(false)
}

fn current_rss_bytes() -> u64 {
    let mut sys = System::new();
    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    sys.process(pid).map(|p| p.memory()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(idle_secs: u64) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "hashing".into(),
            idle_timeout_secs: idle_secs,
            disable_cleanup: idle_secs == 0,
            load_timeout_secs: 1,
            retry_cooldown_secs: 60,
            ..EmbeddingConfig::default()
        }
    }

    fn counting_loader(loads: Arc<AtomicUsize>, delay: Duration) -> BackendLoader {
        Arc::new(move |_device| {
            std::thread::sleep(delay);
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(HashingBackend::new(EMBEDDING_DIM)) as Box<dyn EmbeddingBackend>)
        })
    }

    #[test]
    fn loads_lazily_on_first_embed() {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = EmbeddingService::new(&config(0), Some(counting_loader(loads.clone(), Duration::ZERO)));
        assert_eq!(service.state(), ModelState::Unloaded);
        assert!(service.try_get().is_none());

        let v = service.embed("hello world").unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
        assert_eq!(service.state(), ModelState::Ready);
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = service.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.device, Some(Device::Cpu));
    }

    #[test]
    fn concurrent_callers_share_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = EmbeddingService::new(
            &config(0),
            Some(counting_loader(loads.clone(), Duration::from_millis(100))),
        );

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let service = service.clone();
                std::thread::spawn(move || service.embed(&format!("text {i}")).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().len(), EMBEDDING_DIM);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn falls_back_to_cpu_when_accelerators_reject() {
        let tried = Arc::new(Mutex::new(Vec::new()));
        let tried_clone = tried.clone();
        let loader: BackendLoader = Arc::new(move |device| {
            tried_clone.lock().push(device);
            if device != Device::Cpu {
                anyhow::bail!("{device} not available");
            }
            Ok(Box::new(HashingBackend::new(8)) as Box<dyn EmbeddingBackend>)
        });
        let service = EmbeddingService::new(&config(0), Some(loader));
        service.force_load().unwrap();
        assert_eq!(*tried.lock(), vec![Device::Cuda, Device::CoreMl, Device::Cpu]);
        assert_eq!(service.dimensions(), 8);
    }

    #[test]
    fn forced_load_failure_is_an_error() {
        let loader: BackendLoader = Arc::new(|_| anyhow::bail!("model file corrupt"));
        let service = EmbeddingService::new(&config(0), Some(loader));
        let err = service.force_load().err().unwrap();
        assert!(matches!(err, EngineError::ModelUnavailable(_)));
        assert_eq!(service.state(), ModelState::Failed);
        assert!(service.embed("x").is_err());
        assert_eq!(service.stats().load_failures, 1);
    }

    #[test]
    fn failed_load_waits_out_the_cooldown() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let loader: BackendLoader = Arc::new(move |device| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                anyhow::bail!("{device} busy");
            }
            Ok(Box::new(HashingBackend::new(EMBEDDING_DIM)) as Box<dyn EmbeddingBackend>)
        });
        let cfg = EmbeddingConfig { retry_cooldown_secs: 1, ..config(0) };
        let service = EmbeddingService::new(&cfg, Some(loader));

        // One full pass over the three devices fails.
        assert!(service.embed("x").is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Inside the cooldown nothing is re-attempted.
        for _ in 0..5 {
            assert!(matches!(service.embed("x"), Err(EngineError::ModelUnavailable(_))));
        }
        service.preload_background();
        assert_eq!(service.state(), ModelState::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(service.embed("x").unwrap().len(), EMBEDDING_DIM);
        assert_eq!(service.state(), ModelState::Ready);
    }

    #[test]
    fn disabled_service_reports_unavailable() {
        let service = EmbeddingService::new(&config(0), None);
        assert!(!service.is_enabled());
        assert!(matches!(
            service.embed("x"),
            Err(EngineError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn background_preload_then_force_load_waits() {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = EmbeddingService::new(
            &config(0),
            Some(counting_loader(loads.clone(), Duration::from_millis(100))),
        );
        service.preload_background();
        assert_eq!(service.state(), ModelState::Loading);
        service.force_load().unwrap();
        assert_eq!(service.state(), ModelState::Ready);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_timer_unloads_model() {
        let loads = Arc::new(AtomicUsize::new(0));
        let service = EmbeddingService::new(&config(1), Some(counting_loader(loads.clone(), Duration::ZERO)));
        service.embed("warm up").unwrap();
        assert_eq!(service.state(), ModelState::Ready);

        std::thread::sleep(Duration::from_millis(1600));
        assert_eq!(service.state(), ModelState::Unloaded);
        assert_eq!(service.stats().unloads, 1);

        // Next call reloads transparently.
        service.embed("again").unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        service.cancel_cleanup();
        service.cancel_cleanup();
    }

    #[test]
    fn unload_if_idle_respects_recent_use() {
        let service = EmbeddingService::new(
            &config(60),
            Some(counting_loader(Arc::new(AtomicUsize::new(0)), Duration::ZERO)),
        );
        service.embed("fresh").unwrap();
        assert!(!service.unload_if_idle());
        assert!(service.unload());
        assert!(!service.unload());
        service.cancel_cleanup();
    }

    #[test]
    fn current_thread_runtime_gets_sentinel_while_loading() {
        let service = EmbeddingService::new(
            &config(0),
            Some(counting_loader(Arc::new(AtomicUsize::new(0)), Duration::from_millis(200))),
        );
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let v = rt.block_on(async { service.embed("query").unwrap() });
        assert!(crate::embedding::is_zero_vector(&v));
        assert_ne!(service.state(), ModelState::Unloaded);

        // Off the runtime the caller blocks until ready and gets a real vector.
        let v = service.embed("query").unwrap();
        assert!(!crate::embedding::is_zero_vector(&v));
    }
}
