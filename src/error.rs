//! Error taxonomy shared by every boundary operation.
//!
//! Internal helpers use `anyhow`; anything a caller of [`crate::Engine`] can
//! observe is folded into [`EngineError`] so the HTTP layer can tell a
//! duplicate from a validation problem from a storage fault.

use thiserror::Error;

/// Convenience alias for boundary results.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Content hash already owned by a different task id. Callers treat this
    /// as "already indexed".
    #[error("content already archived under task id {existing_task_id} (rejected for {task_id})")]
    DuplicateContent {
        task_id: String,
        existing_task_id: String,
    },

    /// The embedding model failed to load or is disabled.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    /// SQLite error. Busy/locked errors are retried by the write queue.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input rejected before reaching storage.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    /// Queue depth is at its configured limit.
    #[error("write queue saturated ({depth}/{limit})")]
    QueueSaturated { depth: usize, limit: usize },

    /// The write queue no longer accepts work.
    #[error("write queue is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Lock contention that is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Short machine-readable name, used in logs and operation reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateContent { .. } => "duplicate_content",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Validation { .. } => "validation",
            Self::QueueSaturated { .. } => "queue_saturated",
            Self::ShuttingDown => "shutting_down",
            Self::Internal(_) => "internal",
        }
    }
}
