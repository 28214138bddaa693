use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ModelError;
use crate::batch::BatchProgress;

/// Default number of retries allowed for a failed task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Dataset,
    Model,
}

impl CollectionKind {
    /// Path segment used by the hub API (`datasets` / `models`).
    pub fn api_segment(self) -> &'static str {
        match self {
            Self::Dataset => "datasets",
            Self::Model => "models",
        }
    }
}

impl std::fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dataset => f.write_str("dataset"),
            Self::Model => f.write_str("model"),
        }
    }
}

/// A remote collection: repo id, kind and revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub repo_id: String,
    pub kind: CollectionKind,
    pub revision: String,
}

impl CollectionRef {
    pub fn new(
        repo_id: impl Into<String>,
        kind: CollectionKind,
        revision: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let repo_id = repo_id.into();
        let revision = revision.into();
        if repo_id.is_empty()
            || repo_id.starts_with('/')
            || repo_id.ends_with('/')
            || repo_id.contains("..")
            || repo_id.chars().any(char::is_whitespace)
        {
            return Err(ModelError::InvalidCollection(format!(
                "bad repo id: {repo_id:?}"
            )));
        }
        if revision.is_empty() {
            return Err(ModelError::InvalidCollection("empty revision".into()));
        }
        Ok(Self {
            repo_id,
            kind,
            revision,
        })
    }

    /// Filesystem-safe key, stable across runs.
    ///
    /// The readable prefix may collide (`a/b_c` vs `a_b/c`), so a short digest
    /// of the full reference is appended.
    pub fn key(&self) -> String {
        let readable: String = self
            .repo_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let data = format!("{}:{}@{}", self.kind, self.repo_id, self.revision);
        let digest = Sha256::digest(data.as_bytes());
        format!("{readable}-{}", hex::encode(&digest[..4]))
    }
}

impl std::fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}@{}", self.kind, self.repo_id, self.revision)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    /// Between batches, waiting for the operator to free space.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether batch execution may be (re)started from this status.
    ///
    /// `running` is accepted because a crashed process leaves it behind.
    pub fn can_resume(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download job for one collection into one target directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub collection: CollectionRef,
    pub target_dir: PathBuf,
    pub status: TaskStatus,
    /// Overall completion percentage, 0–100.
    #[serde(default)]
    pub progress: f64,
    /// Bytes per second observed by the monitor.
    #[serde(default)]
    pub download_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    #[serde(default)]
    pub download_size: u64,
    #[serde(default)]
    pub downloaded_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchProgress>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Task {
    pub fn new(id: impl Into<String>, collection: CollectionRef, target_dir: PathBuf) -> Self {
        Self {
            id: id.into(),
            collection,
            target_dir,
            status: TaskStatus::Pending,
            progress: 0.0,
            download_speed: 0.0,
            eta_secs: None,
            download_size: 0,
            downloaded_size: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            batch: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }
}
