//! Resolved settings consumed by the engine.
//!
//! The library never reads config files or environment variables itself; the
//! binary (or any embedding host) resolves an [`ArchivistConfig`] and hands it
//! over. Every section has defaults so a partial TOML document deserializes.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::archive::search::RepresentativePolicy;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArchivistConfig {
    pub log_level: String,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub queue: QueueConfig,
    pub maintenance: MaintenanceConfig,
    pub indexer: IndexerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Create and maintain the FTS5 lexical index.
    pub enable_fts: bool,
    pub busy_timeout_ms: u64,
    pub max_content_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` (ONNX Runtime), `"hashing"` (deterministic, model-free) or `"disabled"`.
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    /// Force a device (`cuda`, `coreml`, `cpu`) instead of probing.
    pub device: Option<String>,
    pub idle_timeout_secs: u64,
    pub disable_cleanup: bool,
    pub batch_size: usize,
    /// Bumped whenever vectors become incompatible; older rows count as stale.
    pub embedding_version: i64,
    /// How long a forced load waits for an in-flight background load.
    pub load_timeout_secs: u64,
    /// After a failed load, implicit loads are refused for this long.
    pub retry_cooldown_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_k: usize,
    pub min_score: f32,
    pub representative: RepresentativePolicy,
    pub chunk_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub async_writes: bool,
    pub workers: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    /// Depth above which health reports an issue.
    pub depth_warning: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub health_check_enabled: bool,
    /// Also the scheduler tick: the daemon wakes this often, e.g. `"5m"`.
    pub health_check_interval: String,
    pub checkpoint_enabled: bool,
    pub checkpoint_interval: String,
    pub vacuum_enabled: bool,
    pub vacuum_interval: String,
    pub backup_before_vacuum: bool,
    /// Defaults to `<db dir>/backups` when unset.
    pub backup_dir: Option<String>,
    pub backup_retention: usize,
    /// Age after which embeddings count as stale for `reembed`.
    pub stale_after: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexerConfig {
    pub directories: Vec<String>,
    pub extensions: Vec<String>,
    pub workers: usize,
    /// Source files above this size are reduced to structural metadata.
    pub code_size_threshold: usize,
}

impl Default for ArchivistConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            queue: QueueConfig::default(),
            maintenance: MaintenanceConfig::default(),
            indexer: IndexerConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_archivist_dir()
            .join("archive.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            enable_fts: true,
            busy_timeout_ms: 5000,
            max_content_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_archivist_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            device: None,
            idle_timeout_secs: 900,
            disable_cleanup: false,
            batch_size: 32,
            embedding_version: 1,
            load_timeout_secs: 60,
            retry_cooldown_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    /// Identifier of the vectors this configuration produces, recorded in
    /// `schema_meta`. `None` when no provider is configured.
    pub fn model_identifier(&self) -> Option<String> {
        match self.provider.as_str() {
            "local" => Some(self.model.clone()),
            "disabled" | "none" => None,
            other => Some(other.to_string()),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            min_score: 0.1,
            representative: RepresentativePolicy::FirstChunk,
            chunk_size: 4096,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            async_writes: true,
            workers: 2,
            max_queue_size: 1000,
            max_retries: 3,
            retry_base_ms: 50,
            depth_warning: 100,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_enabled: true,
            health_check_interval: "5m".into(),
            checkpoint_enabled: true,
            checkpoint_interval: "6h".into(),
            vacuum_enabled: true,
            vacuum_interval: "7d".into(),
            backup_before_vacuum: true,
            backup_dir: None,
            backup_retention: 3,
            stale_after: "30d".into(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            extensions: [
                "md", "mdc", "txt", "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "toml",
                "yaml", "yml", "json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            workers: num_cpus::get().clamp(1, 8),
            code_size_threshold: 4096,
        }
    }
}

impl ArchivistConfig {
    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Directory for pre-vacuum backups.
    pub fn resolved_backup_dir(&self) -> PathBuf {
        match &self.maintenance.backup_dir {
            Some(dir) => expand_tilde(dir),
            None => self
                .resolved_db_path()
                .parent()
                .map(|p| p.join("backups"))
                .unwrap_or_else(|| PathBuf::from("backups")),
        }
    }
}

/// Returns `~/.archivist/`, or `./.archivist` when no home directory is known.
pub fn default_archivist_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".archivist")
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Parse an interval such as `"250ms"`, `"90s"`, `"15m"`, `"6h"`, `"7d"`,
/// `"2w"` or a bare number of seconds.
pub fn parse_interval(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    anyhow::ensure!(!raw.is_empty(), "empty interval");

    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid interval: {raw}"))?;

    let multiplier: u64 = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 7 * 86_400,
        other => anyhow::bail!("unknown interval unit '{other}' in {raw}"),
    };
    let secs = value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("interval out of range: {raw}"))?;
    Ok(Duration::from_secs(secs))
}
