//! Persisted state vs. on-disk reality.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;

use batchpull_model::{FileRecord, FileStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::StoreError;
use crate::tracker::{FileTracker, FileUpdate, Observation};

/// What to do with files that completed earlier but are no longer on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovedFilesPolicy {
    /// Assume the operator archived them; keep them completed.
    #[default]
    Skip,
    /// Fetch them again.
    Redownload,
}

impl FromStr for MovedFilesPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "redownload" => Ok(Self::Redownload),
            other => Err(format!("unknown moved-files policy: {other}")),
        }
    }
}

/// A completed file missing from the target directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovedFile {
    pub identity: String,
    pub size: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Work still outstanding, ordered by identity.
    pub pending: Vec<FileRecord>,
    /// Files present on disk with an acceptable size.
    pub completed: usize,
    /// Completed-but-relocated files, whatever the policy.
    pub moved: Vec<MovedFile>,
    pub moved_bytes: u64,
    /// Present files whose size disagreed with the listing.
    pub requeued_mismatch: usize,
    pub total_files: usize,
}

impl ReconcileReport {
    pub fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|r| r.expected_size).sum()
    }

    pub fn pending_identities(&self) -> Vec<String> {
        self.pending.iter().map(|r| r.identity.clone()).collect()
    }
}

/// Size of the regular file at `path`, or `None` if nothing usable is there.
///
/// Errors other than "not found" (permissions, I/O) are surfaced.
pub fn probe_file(path: &Path) -> Result<Option<u64>, StoreError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Compares the tracker's persisted records against files under `root`.
///
/// A present file with the expected size, or any size when the expected
/// size is unknown, becomes `completed`; a size disagreement goes back to
/// `pending`. Missing files that were done are reported as moved and, under
/// [`MovedFilesPolicy::Redownload`], requeued. Everything else missing is
/// `pending`. Running it twice without filesystem changes yields the same
/// pending set.
pub fn reconcile(
    tracker: &FileTracker,
    root: &Path,
    policy: MovedFilesPolicy,
) -> Result<ReconcileReport, StoreError> {
    tracker.refresh()?;
    let records = tracker.records();

    let mut report = ReconcileReport {
        total_files: records.len(),
        ..ReconcileReport::default()
    };
    let mut observations = Vec::new();
    let mut pending_ids = Vec::new();

    for record in &records {
        match probe_file(&root.join(&record.identity))? {
            Some(actual) if record.size_matches(actual) => {
                report.completed += 1;
                observations.push(Observation::new(
                    &record.identity,
                    FileStatus::Completed,
                    FileUpdate::completed(actual),
                ));
            }
            Some(actual) => {
                debug!(
                    file = %record.identity,
                    expected = record.expected_size,
                    actual,
                    "size mismatch, requeueing"
                );
                report.requeued_mismatch += 1;
                observations.push(Observation::new(
                    &record.identity,
                    FileStatus::Pending,
                    FileUpdate {
                        actual_size: Some(actual),
                        error_message: Some(format!(
                            "size mismatch: expected {} bytes, found {actual}",
                            record.expected_size
                        )),
                        ..FileUpdate::default()
                    },
                ));
                pending_ids.push(record.identity.clone());
            }
            None if record.is_done() => {
                let size = if record.actual_size > 0 {
                    record.actual_size
                } else {
                    record.expected_size
                };
                report.moved_bytes += size;
                report.moved.push(MovedFile {
                    identity: record.identity.clone(),
                    size,
                    completed_at: record.completed_at,
                });
                if policy == MovedFilesPolicy::Redownload {
                    observations.push(Observation::new(
                        &record.identity,
                        FileStatus::Pending,
                        FileUpdate::default(),
                    ));
                    pending_ids.push(record.identity.clone());
                }
            }
            None => {
                observations.push(Observation::new(
                    &record.identity,
                    FileStatus::Pending,
                    FileUpdate::default(),
                ));
                pending_ids.push(record.identity.clone());
            }
        }
    }

    let changed = tracker.apply_observations(observations)?;
    report.pending = pending_ids
        .iter()
        .filter_map(|id| tracker.get(id))
        .collect();

    info!(
        scope = %tracker.scope(),
        total = report.total_files,
        completed = report.completed,
        pending = report.pending.len(),
        moved = report.moved.len(),
        changed,
        ?policy,
        "reconciled file state"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Integrity check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityState {
    Valid,
    SizeMismatch,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityEntry {
    pub identity: String,
    pub status: FileStatus,
    pub expected_size: u64,
    pub actual_size: Option<u64>,
    pub state: IntegrityState,
}

/// Read-only check of every tracked file against the disk.
pub fn verify_integrity(
    tracker: &FileTracker,
    root: &Path,
) -> Result<Vec<IntegrityEntry>, StoreError> {
    let mut entries = Vec::new();
    for record in tracker.records() {
        let actual = probe_file(&root.join(&record.identity))?;
        let state = match actual {
            None => IntegrityState::Missing,
            Some(size) if record.size_matches(size) => IntegrityState::Valid,
            Some(_) => IntegrityState::SizeMismatch,
        };
        entries.push(IntegrityEntry {
            identity: record.identity,
            status: record.status,
            expected_size: record.expected_size,
            actual_size: actual,
            state,
        });
    }
    Ok(entries)
}
