//! Resumable transfer state.
//!
//! `FileTracker` is the single source of truth for per-file progress inside
//! one scope (a task, or one batch of a task). Every mutation is persisted
//! before the call returns, so a crash never loses an acknowledged update.
//! [`reconcile`] compares that state against what is actually on disk and
//! yields the work still outstanding.

mod aria2_input;
mod backend;
mod layout;
mod reconcile;
mod tasks;
mod tracker;

pub use aria2_input::{InputEntry, parse_input};
pub use backend::{JsonFileBackend, MemoryBackend, StateBackend, read_json, write_json_atomic};
pub use layout::MetadataLayout;
pub use reconcile::{
    IntegrityEntry, IntegrityState, MovedFile, MovedFilesPolicy, ReconcileReport, probe_file,
    reconcile, verify_integrity,
};
pub use tasks::{TaskStats, TaskStore};
pub use tracker::{
    DownloadSummary, FailedFile, FileTracker, FileUpdate, Observation, TrackerSummary,
};

use batchpull_model::{FileStatus, ModelError, TaskStatus};

/// Errors produced by the state stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("file not tracked: {0}")]
    UnknownFile(String),

    #[error("invalid transition for {identity}: {from} -> {to}")]
    InvalidTransition {
        identity: String,
        from: FileStatus,
        to: FileStatus,
    },

    #[error("size mismatch for {identity}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        identity: String,
        expected: u64,
        actual: u64,
    },

    #[error("completing {0} requires the actual size")]
    MissingActualSize(String),

    #[error("aria2 input line {line}: {reason}")]
    Aria2Input { line: usize, reason: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("cannot {action} task {task_id} in status {status}")]
    InvalidTaskState {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },
}

impl StoreError {
    /// Whether the error came from the underlying storage rather than from
    /// a rejected request.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Json(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }
}
