//! Per-batch state machine.
//!
//! Each batch moves through reconciliation, capacity check, delegation,
//! monitoring and a final verification scan before the executor advances, pauses for the
//! operator, or stops on failure.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batchpull_model::{Batch, BatchPlan, BatchProgress, FileStatus, TaskStatus, format_size};
use batchpull_transfer::{FileTracker, MetadataLayout, MovedFilesPolicy, TaskStore, reconcile};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ExecutorError;
use crate::agent::{AgentExit, AgentFile, AgentJob, TransferAgent};
use crate::capacity::CapacityProbe;
use crate::monitor::{Monitor, final_scan};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often the monitor re-scans a running batch.
    pub poll_interval: Duration,
    /// How long to wait for the monitor to stop after the agent exits.
    pub monitor_join_timeout: Duration,
    pub moved_files_policy: MovedFilesPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            monitor_join_timeout: Duration::from_secs(5),
            moved_files_policy: MovedFilesPolicy::Skip,
        }
    }
}

/// Coarse result classification shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Partial,
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every batch of the plan finished.
    Completed {
        batches_run: usize,
        files_completed: usize,
    },
    /// A batch finished; the operator must free space before the next one.
    AwaitingOperator {
        completed_batch: usize,
        next_batch: usize,
        total_batches: usize,
    },
    BatchFailed {
        batch: usize,
        completed: usize,
        failed: usize,
        exit_code: Option<i32>,
    },
    Cancelled {
        batch: usize,
    },
}

impl ExecutionOutcome {
    pub fn status(&self) -> OutcomeStatus {
        match self {
            Self::Completed { .. } | Self::AwaitingOperator { .. } => OutcomeStatus::Success,
            Self::BatchFailed { completed, .. } if *completed > 0 => OutcomeStatus::Partial,
            Self::BatchFailed { .. } | Self::Cancelled { .. } => OutcomeStatus::Failed,
        }
    }
}

/// What a single batch run ended with.
enum BatchRun {
    Finished {
        completed: usize,
        failed: usize,
        exit: AgentExit,
    },
    Cancelled,
}

pub struct BatchExecutor {
    layout: MetadataLayout,
    tasks: Arc<TaskStore>,
    agent: Arc<dyn TransferAgent>,
    probe: Arc<dyn CapacityProbe>,
    config: ExecutorConfig,
    cancel: CancellationToken,
}

impl BatchExecutor {
    pub fn new(
        layout: MetadataLayout,
        tasks: Arc<TaskStore>,
        agent: Arc<dyn TransferAgent>,
        probe: Arc<dyn CapacityProbe>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            layout,
            tasks,
            agent,
            probe,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Shares an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops the agent and marks the task cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the plan from `start_batch` (1-based).
    ///
    /// With `auto_proceed` unset the executor stops after each successful
    /// batch that is not the last, leaving the task `paused`. Errors are
    /// recorded on the task before they are returned.
    pub async fn execute(
        &self,
        task_id: &str,
        plan: &BatchPlan,
        start_batch: usize,
        auto_proceed: bool,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let task = self.tasks.require(task_id)?;
        let total = plan.total_batches();

        if total == 0 {
            info!(task = %task_id, "plan has no batches, nothing to transfer");
            self.tasks.set_status(task_id, TaskStatus::Completed, None)?;
            return Ok(ExecutionOutcome::Completed {
                batches_run: 0,
                files_completed: 0,
            });
        }
        if start_batch == 0 || start_batch > total {
            return Err(ExecutorError::InvalidBatch {
                batch: start_batch,
                total,
            });
        }

        let mut batches_run = 0;
        let mut files_completed = 0;

        for index in start_batch..=total {
            let batch = plan.batch(index).ok_or(ExecutorError::InvalidBatch {
                batch: index,
                total,
            })?;

            if self.cancel.is_cancelled() {
                self.mark(task_id, TaskStatus::Cancelled, None);
                return Ok(ExecutionOutcome::Cancelled { batch: index });
            }
            // The first batch is exempt so that resuming a cancelled task works.
            if index > start_batch && self.cancelled_elsewhere(task_id) {
                info!(task = %task_id, batch = index, "task cancelled, not starting batch");
                return Ok(ExecutionOutcome::Cancelled { batch: index });
            }

            info!(
                task = %task_id,
                batch = index,
                total,
                files = batch.file_count(),
                size = %format_size(batch.total_size),
                "starting batch"
            );

            let run = match self.run_batch(task_id, &task.target_dir, batch, total).await {
                Ok(run) => run,
                Err(e) => {
                    warn!(task = %task_id, batch = index, error = %e, "batch aborted");
                    self.mark(task_id, TaskStatus::Failed, Some(e.to_string()));
                    return Err(e);
                }
            };

            let (completed, failed, exit) = match run {
                BatchRun::Cancelled => {
                    warn!(task = %task_id, batch = index, "batch cancelled");
                    self.mark(task_id, TaskStatus::Cancelled, None);
                    return Ok(ExecutionOutcome::Cancelled { batch: index });
                }
                BatchRun::Finished {
                    completed,
                    failed,
                    exit,
                } => (completed, failed, exit),
            };
            files_completed += completed;

            if failed > 0 || !exit.is_success() {
                let message = failure_message(index, completed, failed, &exit);
                warn!(
                    task = %task_id,
                    batch = index,
                    completed,
                    failed,
                    code = ?exit.code,
                    "{message}"
                );
                self.tasks
                    .set_status(task_id, TaskStatus::Failed, Some(message))?;
                return Ok(ExecutionOutcome::BatchFailed {
                    batch: index,
                    completed,
                    failed,
                    exit_code: exit.code,
                });
            }

            batches_run += 1;
            info!(task = %task_id, batch = index, completed, "batch finished");
            if self.cancelled_elsewhere(task_id) {
                return Ok(ExecutionOutcome::Cancelled { batch: index });
            }

            if index == total {
                self.tasks.set_status(task_id, TaskStatus::Completed, None)?;
                info!(task = %task_id, batches_run, files_completed, "all batches finished");
                return Ok(ExecutionOutcome::Completed {
                    batches_run,
                    files_completed,
                });
            }

            if !auto_proceed {
                self.tasks.set_status(task_id, TaskStatus::Paused, None)?;
                info!(
                    task = %task_id,
                    "batch {index}/{total} done; free space, then run `continue {task_id} {}`",
                    index + 1
                );
                return Ok(ExecutionOutcome::AwaitingOperator {
                    completed_batch: index,
                    next_batch: index + 1,
                    total_batches: total,
                });
            }
        }

        // The loop returns on the last batch.
        Err(ExecutorError::InvalidBatch {
            batch: total + 1,
            total,
        })
    }

    async fn run_batch(
        &self,
        task_id: &str,
        root: &Path,
        batch: &Batch,
        total: usize,
    ) -> Result<BatchRun, ExecutorError> {
        // Recorded first so a failed capacity check still resumes here.
        let progress = BatchProgress::new(task_id, batch, total);
        self.layout.save_progress(&progress)?;
        self.tasks.set_batch_progress(task_id, progress)?;

        let scope = MetadataLayout::batch_scope(task_id, batch.index);
        let tracker = Arc::new(self.layout.open_tracker(&scope)?);
        tracker.initialize(&batch.files)?;
        let report = reconcile(&tracker, root, self.config.moved_files_policy)?;
        if !report.moved.is_empty() {
            info!(
                task = %task_id,
                batch = batch.index,
                moved = report.moved.len(),
                size = %format_size(report.moved_bytes),
                policy = ?self.config.moved_files_policy,
                "completed files no longer on disk"
            );
        }

        // Files already on disk need no further space.
        let required = report.pending_bytes();
        let available = self.probe.available_bytes(root)?;
        if available < required {
            return Err(ExecutorError::CapacityInsufficient {
                batch: batch.index,
                required,
                available,
            });
        }

        self.tasks.set_status(task_id, TaskStatus::Running, None)?;
        tokio::fs::create_dir_all(root).await?;

        let exit = if report.pending.is_empty() {
            info!(task = %task_id, batch = batch.index, "nothing left to transfer");
            AgentExit::success()
        } else {
            tracker.update_status_many(&report.pending_identities(), FileStatus::Downloading)?;
            let job = AgentJob {
                task_id: task_id.to_string(),
                batch: batch.index,
                working_dir: root.to_path_buf(),
                files: report
                    .pending
                    .iter()
                    .map(|r| AgentFile {
                        locator: r.source_locator.clone(),
                        identity: r.identity.clone(),
                    })
                    .collect(),
            };
            info!(
                task = %task_id,
                batch = batch.index,
                agent = self.agent.name(),
                files = job.files.len(),
                size = %format_size(report.pending_bytes()),
                "delegating batch"
            );

            let stop = CancellationToken::new();
            let agent_cancel = self.cancel.child_token();
            let monitor = Monitor {
                tracker: Arc::clone(&tracker),
                tasks: Arc::clone(&self.tasks),
                task_id: task_id.to_string(),
                root: root.to_path_buf(),
                files: Arc::new(batch.files.clone()),
                batch_index: batch.index,
                total_batches: total,
                batch_bytes: batch.total_size,
                interval: self.config.poll_interval,
                agent_cancel: agent_cancel.clone(),
            }
            .spawn(stop.clone());

            let result = self.agent.run(&job, agent_cancel).await;
            stop.cancel();
            self.join_monitor(monitor).await;

            let exit = result?;
            if exit.cancelled {
                return Ok(BatchRun::Cancelled);
            }
            if !exit.is_success() {
                warn!(
                    task = %task_id,
                    batch = batch.index,
                    code = ?exit.code,
                    "transfer agent exited with failure"
                );
            }
            exit
        };

        self.verify(&tracker, root, batch, exit)
    }

    fn verify(
        &self,
        tracker: &FileTracker,
        root: &Path,
        batch: &Batch,
        exit: AgentExit,
    ) -> Result<BatchRun, ExecutorError> {
        let outcome = final_scan(tracker, root, &batch.files)?;
        self.layout.write_summary(&tracker.download_summary())?;
        Ok(BatchRun::Finished {
            completed: outcome.completed,
            failed: outcome.failed,
            exit,
        })
    }

    async fn join_monitor(&self, mut handle: JoinHandle<()>) {
        match tokio::time::timeout(self.config.monitor_join_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "monitor task failed"),
            Err(_) => {
                warn!("monitor did not stop in time, aborting it");
                handle.abort();
            }
        }
    }

    /// Another command marked the task cancelled in the shared registry.
    fn cancelled_elsewhere(&self, task_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::Cancelled)
    }

    /// Best-effort status write on a path that is already failing.
    fn mark(&self, task_id: &str, status: TaskStatus, error: Option<String>) {
        if let Err(e) = self.tasks.set_status(task_id, status, error) {
            warn!(task = %task_id, %status, error = %e, "failed to record task status");
        }
    }
}

fn failure_message(batch: usize, completed: usize, failed: usize, exit: &AgentExit) -> String {
    match exit.code {
        Some(0) => format!("batch {batch}: {failed} file(s) failed verification"),
        code if completed == 0 => {
            format!("batch {batch}: transfer agent failed completely (exit code {code:?})")
        }
        code => format!(
            "batch {batch}: transfer agent exited with code {code:?}, {completed} completed, {failed} failed"
        ),
    }
}
