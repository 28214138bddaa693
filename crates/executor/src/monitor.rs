//! Filesystem scans of a running batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use batchpull_model::{FileSeed, FileStatus, TaskStatus};
use batchpull_transfer::{FileTracker, FileUpdate, Observation, StoreError, TaskStore, probe_file};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::speed::SpeedMeter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ScanOutcome {
    pub completed: usize,
    pub failed: usize,
    /// Bytes on disk for the batch's files, finished or not.
    pub bytes_on_disk: u64,
}

/// In-flight scan: completes files that reached their expected size and
/// records partial progress. Never fails a file, since the agent may still
/// be writing it.
///
/// Nothing is recorded once `stop` has fired: by then the final scan owns
/// the tracker.
pub(crate) fn scan_progress(
    tracker: &FileTracker,
    root: &Path,
    files: &[FileSeed],
    stop: &CancellationToken,
) -> Result<ScanOutcome, StoreError> {
    let mut outcome = ScanOutcome::default();
    let mut observations = Vec::new();

    for file in files {
        let Some(record) = tracker.get(&file.identity) else {
            continue;
        };
        if record.is_done() {
            outcome.completed += 1;
            outcome.bytes_on_disk += record.actual_size;
            continue;
        }
        let Some(actual) = probe_file(&root.join(&file.identity))? else {
            continue;
        };
        outcome.bytes_on_disk += actual;
        if record.expected_size > 0 && actual == record.expected_size {
            outcome.completed += 1;
            observations.push(Observation::new(
                &file.identity,
                FileStatus::Completed,
                FileUpdate::completed(actual),
            ));
        } else if actual > 0 {
            observations.push(Observation::new(
                &file.identity,
                FileStatus::Downloading,
                FileUpdate::progress(actual),
            ));
        }
    }

    tracker.apply_observations_if(observations, || !stop.is_cancelled())?;
    Ok(outcome)
}

/// Authoritative scan after the agent exited. Every file ends up either
/// completed or failed with a reason.
pub(crate) fn final_scan(
    tracker: &FileTracker,
    root: &Path,
    files: &[FileSeed],
) -> Result<ScanOutcome, StoreError> {
    let mut outcome = ScanOutcome::default();
    let mut observations = Vec::new();

    for file in files {
        let Some(record) = tracker.get(&file.identity) else {
            continue;
        };
        match probe_file(&root.join(&file.identity))? {
            Some(actual) if record.size_matches(actual) => {
                outcome.completed += 1;
                outcome.bytes_on_disk += actual;
                observations.push(Observation::new(
                    &file.identity,
                    FileStatus::Completed,
                    FileUpdate::completed(actual),
                ));
            }
            // Archived earlier and left out of this delegation.
            None if record.is_done() => outcome.completed += 1,
            Some(actual) => {
                outcome.failed += 1;
                outcome.bytes_on_disk += actual;
                observations.push(Observation::new(
                    &file.identity,
                    FileStatus::Failed,
                    FileUpdate {
                        actual_size: Some(actual),
                        error_message: Some(format!(
                            "size mismatch: expected {} bytes, found {actual}",
                            record.expected_size
                        )),
                        ..FileUpdate::default()
                    },
                ));
            }
            None => {
                outcome.failed += 1;
                observations.push(Observation::new(
                    &file.identity,
                    FileStatus::Failed,
                    FileUpdate::failed("file not found after transfer"),
                ));
            }
        }
    }

    tracker.apply_observations(observations)?;
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

pub(crate) struct Monitor {
    pub tracker: Arc<FileTracker>,
    pub tasks: Arc<TaskStore>,
    pub task_id: String,
    pub root: PathBuf,
    pub files: Arc<Vec<FileSeed>>,
    pub batch_index: usize,
    pub total_batches: usize,
    pub batch_bytes: u64,
    pub interval: Duration,
    /// Fired when the task is found cancelled in the registry.
    pub agent_cancel: CancellationToken,
}

impl Monitor {
    /// Polls until `stop` fires. Scan errors are logged and retried on the
    /// next tick.
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(self, stop: CancellationToken) {
        let meter = SpeedMeter::new(self.interval * 6, 60);
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; nothing has been written yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.tick(&meter, &stop).await,
            }
        }
        debug!(task = %self.task_id, batch = self.batch_index, "monitor stopped");
    }

    async fn tick(&self, meter: &SpeedMeter, stop: &CancellationToken) {
        let tracker = Arc::clone(&self.tracker);
        let root = self.root.clone();
        let files = Arc::clone(&self.files);
        let stop = stop.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            scan_progress(&tracker, &root, &files, &stop)
        })
        .await;

        let outcome = match scanned {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(task = %self.task_id, error = %e, "progress scan failed");
                return;
            }
            Err(e) => {
                warn!(task = %self.task_id, error = %e, "progress scan panicked");
                return;
            }
        };

        meter.record(outcome.bytes_on_disk);
        let fraction = batch_fraction(&outcome, self.files.len(), self.batch_bytes);
        let progress =
            ((self.batch_index - 1) as f64 + fraction) / self.total_batches as f64 * 100.0;
        let remaining = self.batch_bytes.saturating_sub(outcome.bytes_on_disk);
        let eta = meter.eta(remaining).map(|d| d.as_secs());

        match self.tasks.record_transfer(
            &self.task_id,
            progress,
            outcome.bytes_on_disk,
            meter.bytes_per_second(),
            eta,
        ) {
            Ok(task) if task.status == TaskStatus::Cancelled => {
                if !self.agent_cancel.is_cancelled() {
                    info!(
                        task = %self.task_id,
                        "task cancelled by another command, stopping transfer"
                    );
                    self.agent_cancel.cancel();
                }
            }
            Ok(_) => {}
            Err(e) => warn!(task = %self.task_id, error = %e, "failed to record progress"),
        }
        debug!(
            task = %self.task_id,
            batch = self.batch_index,
            completed = outcome.completed,
            files = self.files.len(),
            progress = format!("{progress:.1}%"),
            "batch progress"
        );
    }
}

/// Completed share of the batch, by bytes when sizes are known.
fn batch_fraction(outcome: &ScanOutcome, files: usize, batch_bytes: u64) -> f64 {
    let fraction = if batch_bytes > 0 {
        outcome.bytes_on_disk as f64 / batch_bytes as f64
    } else if files > 0 {
        outcome.completed as f64 / files as f64
    } else {
        1.0
    };
    fraction.clamp(0.0, 1.0)
}
