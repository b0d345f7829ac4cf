//! Command-line driver: config resolution, commands, model download.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use archivist::config::{default_archivist_dir, expand_tilde, parse_interval, EmbeddingConfig};
use archivist::{
    ArchiveKind, ArchiveStatus, ArchivistConfig, Engine, MaintenanceOp, Priority, SubmitMode,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tracing::info;

const HF_BASE: &str = "https://huggingface.co/sentence-transformers";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "archivist", version, about = "Local memory and search engine for task archives")]
pub struct Cli {
    /// Config file (default: ~/.archivist/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path, overrides the config file and ARCHIVIST_DB
    #[arg(long, global = true)]
    pub db: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Index directories (the configured ones when none are given)
    Index {
        directories: Vec<PathBuf>,
        /// Regenerate chunks even for unchanged files
        #[arg(long)]
        force: bool,
    },
    /// Hybrid search
    Search {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
        #[arg(long)]
        kind: Option<ArchiveKind>,
        #[arg(long)]
        status: Option<ArchiveStatus>,
        #[arg(long)]
        min_score: Option<f32>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one archive
    Get { task_id: String },
    /// Most recently completed archives
    List {
        #[arg(short, default_value_t = 10)]
        n: usize,
        #[arg(long)]
        kind: Option<ArchiveKind>,
    },
    /// Delete an archive
    Delete { task_id: String },
    /// Maintenance status, or run one operation now
    Maintain {
        /// checkpoint, vacuum, health_check or reembed
        operation: Option<MaintenanceOp>,
    },
    /// Re-embed archives with missing or stale vectors
    Reembed {
        /// Age after which vectors count as stale, e.g. "7d"
        #[arg(long)]
        stale_after: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
pub enum ModelAction {
    /// Download the embedding model into the cache directory
    Download,
}

// ── Configuration ────────────────────────────────────────────────────────────

pub fn default_config_path() -> PathBuf {
    default_archivist_dir().join("config.toml")
}

/// Where the configuration came from. Reported once logging is up, since the
/// log level itself is part of the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at this path.
    Defaults(PathBuf),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            Self::File(path) => info!(path = %path.display(), "configuration loaded"),
            Self::Defaults(path) => info!(path = %path.display(), "no config file, using defaults"),
        }
    }
}

/// Read the TOML file if present, then apply env overrides.
pub fn load_config(path: Option<&Path>) -> Result<(ArchivistConfig, ConfigSource)> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let (mut config, source) = if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = toml::from_str(&contents).context("failed to parse config TOML")?;
        (config, ConfigSource::File(path))
    } else {
        (ArchivistConfig::default(), ConfigSource::Defaults(path))
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok((config, source))
}

/// ARCHIVIST_DB, ARCHIVIST_LOG_LEVEL and ARCHIVIST_DEVICE.
fn apply_env_overrides(config: &mut ArchivistConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("ARCHIVIST_DB") {
        config.storage.db_path = val;
    }
    if let Some(val) = var("ARCHIVIST_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(val) = var("ARCHIVIST_DEVICE") {
        config.embedding.device = Some(val);
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// Run a command against a freshly opened engine. Blocking.
pub fn run(command: Command, mut config: ArchivistConfig) -> Result<()> {
    // One-shot commands write synchronously and skip the background schedule.
    config.queue.async_writes = false;
    config.maintenance.enabled = false;
    let engine = Engine::open(config)?;

    let result = dispatch(&engine, command);
    let report = engine.shutdown(SHUTDOWN_TIMEOUT);
    if !report.drained {
        eprintln!("warning: {} queued writes were not applied", report.remaining.len());
    }
    result
}

fn dispatch(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Index { directories, force } => index(engine, &directories, force),
        Command::Search {
            query,
            k,
            kind,
            status,
            min_score,
            json,
        } => {
            let mut q = engine.query(query);
            if let Some(k) = k {
                q.k = k;
            }
            if let Some(min_score) = min_score {
                q = q.with_min_score(min_score);
            }
            if let Some(kind) = kind {
                q = q.with_kind(kind);
            }
            if let Some(status) = status {
                q = q.with_status(status);
            }
            let results = engine.search(&q)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
                return Ok(());
            }
            if results.is_empty() {
                println!("No results.");
            }
            for (i, hit) in results.iter().enumerate() {
                println!("{:>2}. [{:.3}] {} ({})", i + 1, hit.score, hit.title, hit.task_id);
                println!("    {}", hit.excerpt);
            }
            Ok(())
        }
        Command::Get { task_id } => {
            match engine.get(&task_id)? {
                Some(archive) => println!("{}", serde_json::to_string_pretty(&archive)?),
                None => println!("No archive with task id {task_id}"),
            }
            Ok(())
        }
        Command::List { n, kind } => {
            for archive in engine.list_latest(n, kind)? {
                let when = archive.completed_at.as_deref().unwrap_or(&archive.updated_at);
                println!("{when}  {:<10} {}  {}", archive.kind.as_str(), archive.task_id, archive.title);
            }
            Ok(())
        }
        Command::Delete { task_id } => {
            let receipt = engine.delete_with(&task_id, Priority::High, SubmitMode::Sync)?;
            println!("{}", serde_json::to_string(&receipt)?);
            Ok(())
        }
        Command::Maintain { operation } => {
            match operation {
                Some(op) => {
                    let report = engine.trigger_maintenance(op);
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    anyhow::ensure!(report.success, "{op} failed");
                }
                None => println!("{}", serde_json::to_string_pretty(&engine.maintenance_status()?)?),
            }
            Ok(())
        }
        Command::Reembed { stale_after, dry_run } => {
            let stale_after = stale_after.as_deref().map(parse_interval).transpose()?;
            let report = engine.reembed(stale_after, dry_run)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Model { .. } => anyhow::bail!("model commands run outside the engine"),
    }
}

fn index(engine: &Engine, directories: &[PathBuf], force: bool) -> Result<()> {
    let directories: Vec<PathBuf> = directories
        .iter()
        .map(|d| expand_tilde(&d.to_string_lossy()))
        .collect();

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {bar:40.cyan/blue} {pos}/{len} files {msg}")
            .expect("valid template")
            .progress_chars("##-"),
    );
    let on_progress = |p: &archivist::indexer::ScanProgress| {
        pb.set_length(p.total as u64);
        pb.set_position(p.processed as u64);
        let eta = p.eta.map(|d| format!(", eta {}s", d.as_secs())).unwrap_or_default();
        pb.set_message(format!("({:.1} files/s{eta})", p.files_per_sec));
    };
    let stats = engine.scan_with_progress(&directories, force, &on_progress)?;
    pb.finish_and_clear();

    println!(
        "Found {} files: {} indexed, {} skipped, {} failed ({:.1}s)",
        stats.found, stats.indexed, stats.skipped, stats.failed, stats.elapsed_secs
    );
    for error in &stats.errors {
        println!("  {error}");
    }
    Ok(())
}

// ── Model download ───────────────────────────────────────────────────────────

/// Download the ONNX model and tokenizer into the cache directory.
pub async fn model_download(config: &EmbeddingConfig) -> Result<()> {
    let cache_dir = expand_tilde(&config.cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

    for file in ["onnx/model.onnx", "tokenizer.json"] {
        let name = file.rsplit('/').next().unwrap_or(file);
        let dest = cache_dir.join(name);
        if dest.exists() {
            println!("{name} already exists at {}", dest.display());
            continue;
        }
        let url = format!("{HF_BASE}/{}/resolve/main/{file}", config.model);
        println!("Downloading {name}...");
        download_file(&url, &dest).await?;
        println!("Saved to {}", dest.display());
    }

    println!("Model download complete.");
    Ok(())
}

/// Stream `url` to `dest` via a temp file and rename.
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;
    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                    .expect("valid template")
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk).await.context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to rename temp file")?;
    pb.finish_and_clear();
    Ok(())
}
