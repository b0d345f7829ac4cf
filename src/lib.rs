//! Local, embeddable memory and search engine for task archives,
//! documentation and source files.
//!
//! Content is deduplicated by hash, chunked, embedded with a lazily loaded
//! sentence-embedding model, and served through hybrid search that blends
//! vector similarity, BM25, recency and a per-kind weight. Writes flow
//! through an ordered background queue; a maintenance daemon keeps the
//! SQLite file healthy; an indexer bulk-loads directories.
//!
//! # Architecture
//!
//! - **Storage**: SQLite in WAL mode with an optional FTS5 index, one writer
//!   and one reader connection
//! - **Embeddings**: ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions),
//!   loaded on first use and unloaded when idle
//! - **Search**: batched cosine similarity over one representative chunk per
//!   archive, lexical fallback when no model is available
//! - **Writes**: per-key FIFO lanes drained by a worker pool with retries
//!
//! # Modules
//!
//! - [`config`]: resolved settings handed in by the host
//! - [`db`]: connection setup, schema, migrations and health checks
//! - [`archive`]: data model, chunking, the content store and search
//! - [`embedding`]: backends and the model lifecycle service
//! - [`queue`]: the write queue and its health metrics
//! - [`maintenance`]: checkpoint, vacuum, health check and re-embedding
//! - [`indexer`]: directory scanning and id derivation
//! - [`engine`]: the context that owns all of the above
//!
//! ```no_run
//! use archivist::{ArchiveInput, ArchivistConfig, Engine};
//!
//! # fn main() -> archivist::Result<()> {
//! let engine = Engine::open(ArchivistConfig::default())?;
//! engine.upsert(ArchiveInput::new("task-1", "# Auth\n\nJWT design"))?;
//! for hit in engine.search(&engine.query("JWT"))? {
//!     println!("{:.3} {} {}", hit.score, hit.task_id, hit.title);
//! }
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod maintenance;
pub mod queue;

pub use archive::search::{RepresentativePolicy, SearchQuery};
pub use archive::types::{Archive, ArchiveInput, ArchiveKind, ArchiveStatus, SearchResult, UpsertOutcome};
pub use config::ArchivistConfig;
pub use engine::{Engine, WriteReceipt};
pub use error::{EngineError, Result};
pub use maintenance::MaintenanceOp;
pub use queue::{Priority, SubmitMode};
