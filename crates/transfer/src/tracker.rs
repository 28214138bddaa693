use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use batchpull_model::{FileRecord, FileSeed, FileStatus, format_size};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::StoreError;
use crate::backend::{MemoryBackend, StateBackend};

/// Optional field changes carried with a status update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileUpdate {
    pub downloaded_size: Option<u64>,
    pub actual_size: Option<u64>,
    pub error_message: Option<String>,
}

impl FileUpdate {
    pub fn progress(downloaded: u64) -> Self {
        Self {
            downloaded_size: Some(downloaded),
            ..Self::default()
        }
    }

    pub fn completed(actual: u64) -> Self {
        Self {
            actual_size: Some(actual),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// A status concluded from the filesystem rather than requested by an
/// operator. Not checked against the transition table.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub identity: String,
    pub status: FileStatus,
    pub update: FileUpdate,
}

impl Observation {
    pub fn new(identity: impl Into<String>, status: FileStatus, update: FileUpdate) -> Self {
        Self {
            identity: identity.into(),
            status,
            update,
        }
    }
}

/// Counts derived from the tracked records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerSummary {
    pub total_files: usize,
    pub pending: usize,
    pub downloading: usize,
    pub completed: usize,
    pub failed: usize,
    pub moved: usize,
    /// Sum of expected sizes.
    pub total_size: u64,
    /// Sum of actual sizes of completed files.
    pub downloaded_size: u64,
    pub completion_rate: String,
}

impl TrackerSummary {
    pub fn total_size_formatted(&self) -> String {
        format_size(self.total_size)
    }

    pub fn downloaded_size_formatted(&self) -> String {
        format_size(self.downloaded_size)
    }

    pub fn is_complete(&self) -> bool {
        self.completed + self.moved == self.total_files
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFile {
    pub identity: String,
    pub error_message: Option<String>,
    pub attempts: u32,
}

/// Written next to the tracker state when a batch finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub scope: String,
    pub summary: TrackerSummary,
    pub failed_files: Vec<FailedFile>,
    pub generated_at: DateTime<Utc>,
}

/// Durable identity → record map for one scope.
///
/// All mutations run under one lock, are applied to a copy of the map and
/// only replace the in-memory state once the backend accepted the new
/// version. A failed persist leaves both memory and storage unchanged.
pub struct FileTracker {
    scope: String,
    backend: Box<dyn StateBackend>,
    records: Mutex<BTreeMap<String, FileRecord>>,
}

impl FileTracker {
    /// Opens a tracker, loading whatever the backend has persisted.
    pub fn open(
        scope: impl Into<String>,
        backend: impl StateBackend + 'static,
    ) -> Result<Self, StoreError> {
        let records = backend.load()?;
        Ok(Self {
            scope: scope.into(),
            backend: Box::new(backend),
            records: Mutex::new(records),
        })
    }

    /// A tracker with no durable storage.
    pub fn in_memory(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            backend: Box::new(MemoryBackend::new()),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, FileRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, FileRecord>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.backend.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    /// Starts tracking every seed not already tracked, as `pending`.
    ///
    /// Existing records are never overwritten. Returns how many were added.
    pub fn initialize(&self, seeds: &[FileSeed]) -> Result<usize, StoreError> {
        self.import(seeds.iter().map(|s| (s.clone(), FileStatus::Pending)))
    }

    /// Starts tracking seeds with a caller-supplied status, e.g. state
    /// carried over from another download tool.
    pub fn import(
        &self,
        entries: impl IntoIterator<Item = (FileSeed, FileStatus)>,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let added = self.mutate(|records| {
            let mut added = 0;
            for (seed, status) in entries {
                batchpull_model::validate_identity(&seed.identity)?;
                if records.contains_key(&seed.identity) {
                    continue;
                }
                let mut record = FileRecord::new(&seed, status, now);
                if record.is_done() {
                    record.actual_size = seed.size;
                    record.downloaded_size = seed.size;
                    record.completed_at = Some(now);
                }
                records.insert(seed.identity.clone(), record);
                added += 1;
            }
            Ok(added)
        })?;
        debug!(scope = %self.scope, added, "initialized file records");
        Ok(added)
    }

    /// Applies an operator-driven status change.
    ///
    /// Allowed: `pending → downloading`, `downloading → downloading`,
    /// `downloading → completed | failed`, `failed → pending`.
    pub fn update_status(
        &self,
        identity: &str,
        status: FileStatus,
        update: FileUpdate,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.mutate(|records| {
            let record = records
                .get_mut(identity)
                .ok_or_else(|| StoreError::UnknownFile(identity.to_string()))?;
            check_transition(record, status)?;
            apply(record, status, update, now)
        })
    }

    /// Moves several records to the same status in one persisted write.
    ///
    /// Either every record is updated or none is.
    pub fn update_status_many(
        &self,
        identities: &[String],
        status: FileStatus,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        self.mutate(|records| {
            for identity in identities {
                let record = records
                    .get_mut(identity)
                    .ok_or_else(|| StoreError::UnknownFile(identity.clone()))?;
                check_transition(record, status)?;
                apply(record, status, FileUpdate::default(), now)?;
            }
            Ok(identities.len())
        })
    }

    /// Records filesystem-derived conclusions in one persisted write.
    ///
    /// Re-observing a settled status is a no-op, so repeated scans keep the
    /// original timestamps. Returns the number of records that changed.
    pub fn apply_observations(&self, observations: Vec<Observation>) -> Result<usize, StoreError> {
        self.apply_observations_if(observations, || true)
    }

    /// Like [`apply_observations`](Self::apply_observations), but drops the
    /// whole set when `still_current` returns false. The check runs under
    /// the tracker lock, after any write that raced this one has landed.
    pub fn apply_observations_if(
        &self,
        observations: Vec<Observation>,
        still_current: impl FnOnce() -> bool,
    ) -> Result<usize, StoreError> {
        if observations.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let changed = self.mutate(|records| {
            if !still_current() {
                return Ok(None);
            }
            let mut changed = 0;
            for obs in observations {
                let record = records
                    .get_mut(&obs.identity)
                    .ok_or_else(|| StoreError::UnknownFile(obs.identity.clone()))?;
                if is_settled(record, &obs) {
                    continue;
                }
                apply(record, obs.status, obs.update, now)?;
                changed += 1;
            }
            Ok(Some(changed))
        })?;
        if changed.is_none() {
            debug!(scope = %self.scope, "dropped stale observations");
        }
        Ok(changed.unwrap_or(0))
    }

    /// Reloads the in-memory map from the backend.
    pub fn refresh(&self) -> Result<(), StoreError> {
        let loaded = self.backend.load()?;
        *self.lock() = loaded;
        Ok(())
    }

    /// Forgets every record and removes the persisted state.
    pub fn cleanup(&self) -> Result<(), StoreError> {
        let mut guard = self.lock();
        self.backend.clear()?;
        guard.clear();
        info!(scope = %self.scope, "cleared file state");
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<FileRecord> {
        self.lock().get(identity).cloned()
    }

    /// Snapshot of all records, ordered by identity.
    pub fn records(&self) -> Vec<FileRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pending_files(&self) -> Vec<FileRecord> {
        self.with_status(FileStatus::Pending)
    }

    pub fn failed_files(&self) -> Vec<FailedFile> {
        self.lock()
            .values()
            .filter(|r| r.status == FileStatus::Failed)
            .map(|r| FailedFile {
                identity: r.identity.clone(),
                error_message: r.error_message.clone(),
                attempts: r.attempts,
            })
            .collect()
    }

    fn with_status(&self, status: FileStatus) -> Vec<FileRecord> {
        self.lock()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> TrackerSummary {
        let records = self.lock();
        let mut summary = TrackerSummary {
            total_files: records.len(),
            ..TrackerSummary::default()
        };
        for record in records.values() {
            summary.total_size += record.expected_size;
            match record.status {
                FileStatus::Pending => summary.pending += 1,
                FileStatus::Downloading => summary.downloading += 1,
                FileStatus::Completed => {
                    summary.completed += 1;
                    summary.downloaded_size += record.actual_size;
                }
                FileStatus::Failed => summary.failed += 1,
                FileStatus::Moved => summary.moved += 1,
            }
        }
        summary.completion_rate = if summary.total_files == 0 {
            "0%".into()
        } else {
            format!(
                "{:.1}%",
                summary.completed as f64 / summary.total_files as f64 * 100.0
            )
        };
        summary
    }

    /// Builds the end-of-batch report.
    pub fn download_summary(&self) -> DownloadSummary {
        DownloadSummary {
            scope: self.scope.clone(),
            summary: self.summary(),
            failed_files: self.failed_files(),
            generated_at: Utc::now(),
        }
    }
}

fn check_transition(record: &FileRecord, next: FileStatus) -> Result<(), StoreError> {
    if record.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            identity: record.identity.clone(),
            from: record.status,
            to: next,
        })
    }
}

fn is_settled(record: &FileRecord, obs: &Observation) -> bool {
    if record.status != obs.status {
        return false;
    }
    match obs.status {
        FileStatus::Downloading => obs
            .update
            .downloaded_size
            .is_none_or(|d| d == record.downloaded_size),
        FileStatus::Completed => obs
            .update
            .actual_size
            .is_none_or(|a| a == record.actual_size),
        FileStatus::Pending | FileStatus::Failed => {
            obs.update
                .actual_size
                .is_none_or(|a| a == record.actual_size)
                && obs.update.error_message == record.error_message
        }
        FileStatus::Moved => true,
    }
}

/// Stamps timestamps and sizes for a move into `status`.
fn apply(
    record: &mut FileRecord,
    status: FileStatus,
    update: FileUpdate,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match status {
        FileStatus::Completed => {
            let actual = update
                .actual_size
                .ok_or_else(|| StoreError::MissingActualSize(record.identity.clone()))?;
            if !record.size_matches(actual) {
                return Err(StoreError::SizeMismatch {
                    identity: record.identity.clone(),
                    expected: record.expected_size,
                    actual,
                });
            }
            record.actual_size = actual;
            record.downloaded_size = actual;
            record.error_message = None;
            record.completed_at = Some(now);
        }
        FileStatus::Downloading => {
            if record.status != FileStatus::Downloading {
                record.attempts += 1;
                record.error_message = None;
            }
            if record.started_at.is_none() {
                record.started_at = Some(now);
            }
            if let Some(downloaded) = update.downloaded_size {
                record.downloaded_size = downloaded;
            }
        }
        FileStatus::Failed => {
            if let Some(actual) = update.actual_size {
                record.actual_size = actual;
            }
            record.error_message = update.error_message;
            record.completed_at = Some(now);
        }
        FileStatus::Pending => {
            if let Some(actual) = update.actual_size {
                record.actual_size = actual;
            }
            record.downloaded_size = update.downloaded_size.unwrap_or(0);
            record.error_message = update.error_message;
            record.completed_at = None;
        }
        FileStatus::Moved => {}
    }
    record.status = status;
    Ok(())
}
