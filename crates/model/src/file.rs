use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ModelError;
use crate::validation::validate_identity;

/// An inventory entry: one remote file as reported by the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSeed {
    /// Relative path under the target directory; unique per collection.
    pub identity: String,
    /// Where the transfer agent fetches the bytes from.
    pub source_locator: String,
    /// Remote size in bytes; `0` when the listing did not report one.
    pub size: u64,
}

impl FileSeed {
    /// Creates a seed after validating the identity.
    pub fn new(
        identity: impl Into<String>,
        source_locator: impl Into<String>,
        size: u64,
    ) -> Result<Self, ModelError> {
        let identity = identity.into();
        validate_identity(&identity)?;
        Ok(Self {
            identity,
            source_locator: source_locator.into(),
            size,
        })
    }

    /// Lowercased extension used for file-type statistics.
    pub fn extension(&self) -> String {
        std::path::Path::new(&self.identity)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| "no_extension".into())
    }
}

/// Lifecycle state of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    /// Completed earlier, then archived off the target media.
    Moved,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Moved => "moved",
        }
    }

    /// Whether the status may be entered through an operator-driven update.
    ///
    /// `moved` is only ever concluded from the filesystem.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Downloading)
                | (Self::Downloading, Self::Downloading)
                | (Self::Downloading, Self::Completed)
                | (Self::Downloading, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one remote file inside a tracker scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub identity: String,
    pub source_locator: String,
    pub expected_size: u64,
    pub status: FileStatus,
    #[serde(default)]
    pub downloaded_size: u64,
    #[serde(default)]
    pub actual_size: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Creates a fresh record for `seed` in the given status.
    pub fn new(seed: &FileSeed, status: FileStatus, now: DateTime<Utc>) -> Self {
        Self {
            identity: seed.identity.clone(),
            source_locator: seed.source_locator.clone(),
            expected_size: seed.size,
            status,
            downloaded_size: 0,
            actual_size: 0,
            attempts: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether `actual` satisfies the completeness rule for this record.
    ///
    /// An unknown expected size (`0`) accepts any present file.
    pub fn size_matches(&self, actual: u64) -> bool {
        self.expected_size == 0 || self.expected_size == actual
    }

    /// Whether the record counts as finished work.
    pub fn is_done(&self) -> bool {
        matches!(self.status, FileStatus::Completed | FileStatus::Moved)
    }

    pub fn seed(&self) -> FileSeed {
        FileSeed {
            identity: self.identity.clone(),
            source_locator: self.source_locator.clone(),
            size: self.expected_size,
        }
    }
}
