//! Core archive type definitions.
//!
//! Defines [`ArchiveKind`] and [`ArchiveStatus`] (the enumerated columns),
//! [`Archive`] (a stored row), [`ArchiveInput`] (what callers submit) and the
//! transient [`SearchResult`].

use serde::{Deserialize, Serialize};

/// Category of an archived artifact. Drives the ranking weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    /// Completed task archive.
    Archive,
    /// Retrospective notes; ranked slightly above everything else.
    Reflection,
    Doc,
    /// Standing rules and conventions; ranked below other kinds.
    Rule,
    Code,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 5] = [
        Self::Archive,
        Self::Reflection,
        Self::Doc,
        Self::Rule,
        Self::Code,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Reflection => "reflection",
            Self::Doc => "doc",
            Self::Rule => "rule",
            Self::Code => "code",
        }
    }

    /// Multiplier applied to the hybrid score.
    pub fn weight(&self) -> f32 {
        match self {
            Self::Reflection => 1.1,
            Self::Rule => 0.8,
            Self::Archive | Self::Doc | Self::Code => 1.0,
        }
    }
}

impl std::fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArchiveKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archive" => Ok(Self::Archive),
            "reflection" => Ok(Self::Reflection),
            "doc" => Ok(Self::Doc),
            "rule" => Ok(Self::Rule),
            "code" => Ok(Self::Code),
            _ => Err(format!("unknown archive kind: {s}")),
        }
    }
}

/// Lifecycle status of the task an archive describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Pending,
    InProgress,
    Done,
    Deferred,
    Cancelled,
    Blocked,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Deferred => "deferred",
            Self::Cancelled => "cancelled",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArchiveStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "pending" | "todo" => Ok(Self::Pending),
            "in_progress" | "active" => Ok(Self::InProgress),
            "done" | "completed" | "complete" => Ok(Self::Done),
            "deferred" => Ok(Self::Deferred),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("unknown archive status: {s}")),
        }
    }
}

/// A stored archive, matching the `archives` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub task_id: String,
    pub title: String,
    pub filepath: Option<String>,
    /// Hex SHA-256 of the raw content.
    pub content_hash: String,
    pub content: String,
    pub kind: ArchiveKind,
    pub status: Option<ArchiveStatus>,
    /// RFC 3339 completion timestamp.
    pub completed_at: Option<String>,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub embedding_version: i64,
    pub last_embedded_at: Option<String>,
}

/// Upsert request. Only `task_id` and `content` are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveInput {
    pub task_id: String,
    pub content: String,
    pub filepath: Option<String>,
    pub title: Option<String>,
    pub kind: Option<ArchiveKind>,
    pub status: Option<ArchiveStatus>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`; normalized on write.
    pub completed_at: Option<String>,
    /// Regenerate chunks even when the content hash is unchanged.
    #[serde(default)]
    pub force_reindex: bool,
}

impl ArchiveInput {
    pub fn new(task_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_filepath(mut self, filepath: impl Into<String>) -> Self {
        self.filepath = Some(filepath.into());
        self
    }

    pub fn with_kind(mut self, kind: ArchiveKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: ArchiveStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_completed_at(mut self, completed_at: impl Into<String>) -> Self {
        self.completed_at = Some(completed_at.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force_reindex = true;
        self
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Same id, same content, no forced reindex: nothing was touched.
    Unchanged,
}

/// A ranked search hit. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub task_id: String,
    pub title: String,
    pub score: f32,
    pub excerpt: String,
    pub kind: ArchiveKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ArchiveStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in ArchiveKind::ALL {
            assert_eq!(kind.as_str().parse::<ArchiveKind>().unwrap(), kind);
        }
        assert!("memo".parse::<ArchiveKind>().is_err());
    }

    #[test]
    fn kind_weights() {
        assert_eq!(ArchiveKind::Reflection.weight(), 1.1);
        assert_eq!(ArchiveKind::Rule.weight(), 0.8);
        assert_eq!(ArchiveKind::Code.weight(), 1.0);
    }

    #[test]
    fn status_accepts_common_spellings() {
        assert_eq!("In Progress".parse::<ArchiveStatus>().unwrap(), ArchiveStatus::InProgress);
        assert_eq!("completed".parse::<ArchiveStatus>().unwrap(), ArchiveStatus::Done);
        assert_eq!("canceled".parse::<ArchiveStatus>().unwrap(), ArchiveStatus::Cancelled);
        assert!("exploded".parse::<ArchiveStatus>().is_err());
    }
}
