//! Command surface shared by the CLI and tests.
//!
//! `BatchService` owns the metadata layout, task registry and the three
//! external seams, and exposes one method per operator command.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batchpull_inventory::{AnalyzeOptions, InventoryAnalysis, InventoryAnalyzer, ListingProvider};
use batchpull_model::{
    BatchPlan, CollectionRef, FileSeed, FileStatus, ModelError, SafetyMargin, Task, TaskStatus,
    format_size,
};
use batchpull_planner::{ManagementAdvice, UsagePoint, suggest_management, usage_timeline};
use batchpull_transfer::{
    FailedFile, IntegrityEntry, IntegrityState, MetadataLayout, StoreError, TaskStats, TaskStore,
    TrackerSummary, probe_file, verify_integrity,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ExecutorError;
use crate::agent::TransferAgent;
use crate::capacity::{CapacityProbe, MIN_TARGET_FREE_SPACE, validate_download_dir};
use crate::executor::{BatchExecutor, ExecutionOutcome, ExecutorConfig, OutcomeStatus};
use crate::hfd;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub metadata_dir: PathBuf,
    /// Tasks download to `<downloads_dir>/<repo_id>` unless told otherwise.
    pub downloads_dir: PathBuf,
    pub safety_margin: SafetyMargin,
    pub analyze: AnalyzeOptions,
    pub executor: ExecutorConfig,
    pub min_free_space: u64,
}

impl ServiceConfig {
    pub fn new(metadata_dir: impl Into<PathBuf>, downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            downloads_dir: downloads_dir.into(),
            safety_margin: SafetyMargin::default(),
            analyze: AnalyzeOptions::default(),
            executor: ExecutorConfig::default(),
            min_free_space: MIN_TARGET_FREE_SPACE,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Broad failure classes reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Storage,
    Permission,
    Network,
    State,
    Input,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Storage => "storage",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::State => "state",
            Self::Input => "input",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("no usable inventory for {collection}: {reason}")]
    InventoryUnavailable { collection: String, reason: String },

    #[error("no saved plan for task {0}")]
    PlanMissing(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("import failed: {0}")]
    Import(String),
}

impl ServiceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Store(e) => store_kind(e),
            Self::Executor(e) => match e {
                _ if e.is_permission_denied() => FailureKind::Permission,
                ExecutorError::Store(e) => store_kind(e),
                ExecutorError::TransferAgent(_) => FailureKind::Network,
                ExecutorError::InvalidBatch { .. } => FailureKind::Input,
                ExecutorError::Io(_)
                | ExecutorError::CapacityInsufficient { .. }
                | ExecutorError::Capacity(_)
                | ExecutorError::InvalidTarget(_) => FailureKind::Storage,
            },
            Self::Model(_) | Self::Import(_) => FailureKind::Input,
            Self::InventoryUnavailable { .. } => FailureKind::Network,
            Self::PlanMissing(_) | Self::InvalidState(_) => FailureKind::State,
        }
    }
}

fn store_kind(e: &StoreError) -> FailureKind {
    if e.is_permission_denied() {
        FailureKind::Permission
    } else if e.is_storage() {
        FailureKind::Storage
    } else if matches!(e, StoreError::Model(_) | StoreError::Aria2Input { .. }) {
        FailureKind::Input
    } else {
        FailureKind::State
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub analysis: InventoryAnalysis,
    pub plan: BatchPlan,
    pub timeline: Vec<UsagePoint>,
    pub advice: Option<ManagementAdvice>,
    pub saved_to: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteReport {
    pub task_id: String,
    pub total_batches: usize,
    pub outcome: ExecutionOutcome,
    pub status: OutcomeStatus,
    /// What the operator should do next, if anything.
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchState {
    pub index: usize,
    pub files: usize,
    pub size: u64,
    /// `None` until the batch has been started.
    pub summary: Option<TrackerSummary>,
    pub failed_files: Vec<FailedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub task: Task,
    pub status: OutcomeStatus,
    pub batches: Vec<BatchState>,
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchIntegrity {
    pub index: usize,
    pub entries: Vec<IntegrityEntry>,
}

impl BatchIntegrity {
    pub fn count(&self, state: IntegrityState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }
}

/// Result of adopting an hfd download directory.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    /// `None` on a dry run.
    pub task_id: Option<String>,
    pub collection: CollectionRef,
    pub source: PathBuf,
    pub target_dir: PathBuf,
    pub total_files: usize,
    pub completed_files: usize,
    pub completed_size: u64,
    /// Sum of known sizes; files hfd never sized count as zero.
    pub known_size: u64,
    pub total_batches: usize,
    /// A few pending identities, for display.
    pub sample_pending: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReport {
    pub task_id: String,
    pub target_dir: PathBuf,
    pub kept_files: bool,
    pub removed_files: usize,
    pub freed_bytes: u64,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct BatchService {
    config: ServiceConfig,
    layout: MetadataLayout,
    tasks: Arc<TaskStore>,
    analyzer: InventoryAnalyzer,
    agent: Arc<dyn TransferAgent>,
    probe: Arc<dyn CapacityProbe>,
    cancel: CancellationToken,
}

impl BatchService {
    pub fn new(
        config: ServiceConfig,
        provider: Arc<dyn ListingProvider>,
        agent: Arc<dyn TransferAgent>,
        probe: Arc<dyn CapacityProbe>,
    ) -> Result<Self, ServiceError> {
        fs::create_dir_all(&config.metadata_dir).map_err(StoreError::from)?;
        let layout = MetadataLayout::new(&config.metadata_dir);
        let tasks = Arc::new(TaskStore::open(layout.tasks_file())?);
        Ok(Self {
            config,
            layout,
            tasks,
            analyzer: InventoryAnalyzer::new(provider),
            agent,
            probe,
            cancel: CancellationToken::new(),
        })
    }

    /// Fires on shutdown requests; stops listing and any running agent.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn layout(&self) -> &MetadataLayout {
        &self.layout
    }

    fn executor(&self) -> BatchExecutor {
        BatchExecutor::new(
            self.layout.clone(),
            Arc::clone(&self.tasks),
            Arc::clone(&self.agent),
            Arc::clone(&self.probe),
            self.config.executor.clone(),
        )
        .with_cancel_token(self.cancel.clone())
    }

    pub fn default_target(&self, collection: &CollectionRef) -> PathBuf {
        self.config.downloads_dir.join(&collection.repo_id)
    }

    /// Enumerates a collection. Never fails; see [`InventoryAnalyzer::analyze`].
    pub async fn analyze(
        &self,
        collection: &CollectionRef,
        options: &AnalyzeOptions,
    ) -> InventoryAnalysis {
        self.analyzer.analyze(collection, options, &self.cancel).await
    }

    /// Full enumeration for planning; estimates are rejected.
    async fn inventory(&self, collection: &CollectionRef) -> Result<InventoryAnalysis, ServiceError> {
        let options = AnalyzeOptions {
            quick: false,
            ..self.config.analyze.clone()
        };
        let analysis = self.analyze(collection, &options).await;
        if !analysis.is_actionable() {
            return Err(ServiceError::InventoryUnavailable {
                collection: collection.to_string(),
                reason: analysis
                    .note
                    .unwrap_or_else(|| "collection has no files".into()),
            });
        }
        if let Some(note) = &analysis.note {
            warn!(collection = %collection, "{note}");
        }
        Ok(analysis)
    }

    fn capacity(&self, path: &Path, requested: Option<u64>) -> Result<u64, ServiceError> {
        match requested {
            Some(capacity) => Ok(capacity),
            None => Ok(self.probe.available_bytes(path)?),
        }
    }

    /// Plans a collection against `capacity` (free space at the downloads
    /// directory when unset) and saves the plan under `plans/`.
    pub async fn plan(
        &self,
        collection: &CollectionRef,
        capacity: Option<u64>,
        margin: Option<SafetyMargin>,
    ) -> Result<PlanReport, ServiceError> {
        let analysis = self.inventory(collection).await?;
        let capacity = self.capacity(&self.config.downloads_dir, capacity)?;
        let plan = batchpull_planner::plan(
            &analysis.inventory,
            capacity,
            margin.unwrap_or(self.config.safety_margin),
        );
        let saved_to = self.layout.save_collection_plan(collection, &plan)?;
        info!(collection = %collection, path = %saved_to.display(), "saved plan");

        Ok(PlanReport {
            timeline: usage_timeline(&plan),
            advice: suggest_management(&plan, capacity),
            analysis,
            plan,
            saved_to,
        })
    }

    /// Creates a task for `collection` and runs it from the first batch.
    pub async fn execute(
        &self,
        collection: &CollectionRef,
        capacity: Option<u64>,
        auto_proceed: bool,
        target_dir: Option<PathBuf>,
    ) -> Result<ExecuteReport, ServiceError> {
        let target = target_dir.unwrap_or_else(|| self.default_target(collection));
        // Persisted as-is; later runs may start from another cwd.
        let target = std::path::absolute(&target).map_err(ExecutorError::from)?;
        let available =
            validate_download_dir(&target, self.probe.as_ref(), self.config.min_free_space)?;

        let analysis = self.inventory(collection).await?;
        let capacity = capacity.unwrap_or(available);
        let plan = batchpull_planner::plan(
            &analysis.inventory,
            capacity,
            self.config.safety_margin,
        );

        let task = self.tasks.create(collection.clone(), target)?;
        self.tasks.update(&task.id, |t| {
            t.download_size = plan.total_size;
            Ok(())
        })?;
        self.layout.save_plan(&task.id, &plan)?;
        info!(
            task = %task.id,
            collection = %collection,
            batches = plan.total_batches(),
            size = %format_size(plan.total_size),
            strategy = %plan.strategy,
            "task planned"
        );

        self.run(&task.id, &plan, 1, auto_proceed).await
    }

    /// Runs one specific batch of an existing task, then stops.
    pub async fn continue_batch(
        &self,
        task_id: &str,
        batch: usize,
    ) -> Result<ExecuteReport, ServiceError> {
        let task = self.tasks.require(task_id)?;
        if task.status == TaskStatus::Completed {
            return Err(ServiceError::InvalidState(format!(
                "task {task_id} is already completed"
            )));
        }
        let plan = self.saved_plan(task_id)?;
        validate_download_dir(&task.target_dir, self.probe.as_ref(), self.config.min_free_space)?;
        self.run(task_id, &plan, batch, false).await
    }

    /// Picks an interrupted task back up.
    ///
    /// A paused task continues with the batch after the one it finished.
    /// Anything else re-runs its current batch; files already on disk are
    /// reconciled and not fetched again. Failed tasks consume one retry.
    pub async fn resume(
        &self,
        task_id: &str,
        auto_proceed: bool,
    ) -> Result<ExecuteReport, ServiceError> {
        let task = self.tasks.require(task_id)?;
        if !task.status.can_resume() {
            return Err(ServiceError::InvalidState(format!(
                "task {task_id} is already completed"
            )));
        }
        let plan = self.saved_plan(task_id)?;
        let start = match (task.status, &task.batch) {
            (TaskStatus::Paused, Some(progress)) => progress.current_batch + 1,
            (_, Some(progress)) => progress.current_batch,
            (_, None) => 1,
        };
        if task.status == TaskStatus::Failed {
            self.tasks.retry(task_id)?;
        }
        info!(task = %task_id, from = %task.status, batch = start, "resuming task");

        validate_download_dir(&task.target_dir, self.probe.as_ref(), self.config.min_free_space)?;
        self.run(task_id, &plan, start, auto_proceed).await
    }

    async fn run(
        &self,
        task_id: &str,
        plan: &BatchPlan,
        start: usize,
        auto_proceed: bool,
    ) -> Result<ExecuteReport, ServiceError> {
        let outcome = self
            .executor()
            .execute(task_id, plan, start, auto_proceed)
            .await?;
        Ok(ExecuteReport {
            task_id: task_id.to_string(),
            total_batches: plan.total_batches(),
            status: outcome.status(),
            next_step: next_step_after(task_id, &outcome),
            outcome,
        })
    }

    fn saved_plan(&self, task_id: &str) -> Result<BatchPlan, ServiceError> {
        self.layout
            .load_plan(task_id)?
            .ok_or_else(|| ServiceError::PlanMissing(task_id.to_string()))
    }

    /// Task record plus per-batch file counts.
    pub fn status(&self, task_id: &str) -> Result<TaskStatusReport, ServiceError> {
        let task = self.tasks.require(task_id)?;
        let plan = self.layout.load_plan(task_id)?;

        let mut batches = Vec::new();
        for batch in plan.iter().flat_map(|p| p.batches.iter()) {
            let tracker = self
                .layout
                .open_tracker(&MetadataLayout::batch_scope(task_id, batch.index))?;
            let started = !tracker.is_empty();
            batches.push(BatchState {
                index: batch.index,
                files: batch.file_count(),
                size: batch.total_size,
                summary: started.then(|| tracker.summary()),
                failed_files: tracker.failed_files(),
            });
        }

        let any_completed = batches
            .iter()
            .filter_map(|b| b.summary.as_ref())
            .any(|s| s.completed + s.moved > 0);
        let status = match task.status {
            TaskStatus::Failed | TaskStatus::Cancelled if any_completed => OutcomeStatus::Partial,
            TaskStatus::Failed | TaskStatus::Cancelled => OutcomeStatus::Failed,
            _ => OutcomeStatus::Success,
        };
        let next_step = next_step_for_task(&task);

        Ok(TaskStatusReport {
            task,
            status,
            batches,
            next_step,
        })
    }

    pub fn cancel(&self, task_id: &str) -> Result<Task, ServiceError> {
        Ok(self.tasks.cancel(task_id)?)
    }

    /// Read-only comparison of every started batch against the disk.
    pub fn verify(&self, task_id: &str) -> Result<Vec<BatchIntegrity>, ServiceError> {
        let task = self.tasks.require(task_id)?;
        let plan = self.saved_plan(task_id)?;
        let mut out = Vec::new();
        for batch in &plan.batches {
            let tracker = self
                .layout
                .open_tracker(&MetadataLayout::batch_scope(task_id, batch.index))?;
            if tracker.is_empty() {
                continue;
            }
            out.push(BatchIntegrity {
                index: batch.index,
                entries: verify_integrity(&tracker, &task.target_dir)?,
            });
        }
        Ok(out)
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        self.tasks.list(status)
    }

    pub fn stats(&self) -> TaskStats {
        self.tasks.stats()
    }

    /// Points a task at a new download directory, e.g. after the operator
    /// moved the partial download to another disk.
    pub fn relocate(&self, task_id: &str, target_dir: &Path) -> Result<Task, ServiceError> {
        let target = std::path::absolute(target_dir).map_err(ExecutorError::from)?;
        let task = self.tasks.update(task_id, |task| {
            if task.status == TaskStatus::Running {
                return Err(StoreError::InvalidTaskState {
                    task_id: task.id.clone(),
                    status: task.status,
                    action: "relocate",
                });
            }
            task.target_dir = target.clone();
            Ok(())
        })?;
        info!(task = %task_id, target = %target.display(), "task relocated");
        Ok(task)
    }

    /// Adopts a download started with hfd.
    ///
    /// The listed files are checked against `target_dir` (default: the
    /// directory holding `.hfd`), planned, and recorded with finished files
    /// already completed. The new task is then resumed like any other.
    pub fn import_hfd(
        &self,
        source: &Path,
        target_dir: Option<PathBuf>,
        capacity: Option<u64>,
        dry_run: bool,
    ) -> Result<ImportReport, ServiceError> {
        let source = std::path::absolute(source).map_err(ExecutorError::from)?;
        let metadata_dir = hfd::metadata_dir(&source);
        let target = match target_dir {
            Some(dir) => std::path::absolute(dir).map_err(ExecutorError::from)?,
            None => metadata_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| source.clone()),
        };
        let imported = hfd::read_source(&source, &target)?;

        let completed_size: u64 = imported.completed().map(|f| f.seed.size).sum();
        let seeds: Vec<FileSeed> = imported.files.iter().map(|f| f.seed.clone()).collect();
        // Finished files already occupy part of the disk the plan may use.
        let capacity = match capacity {
            Some(capacity) => capacity,
            None => self.probe.available_bytes(&target)? + completed_size,
        };
        let plan = batchpull_planner::plan(&seeds, capacity, self.config.safety_margin);

        let mut report = ImportReport {
            task_id: None,
            collection: imported.collection.clone(),
            source: imported.metadata_dir.clone(),
            target_dir: target.clone(),
            total_files: imported.files.len(),
            completed_files: imported.completed().count(),
            completed_size,
            known_size: plan.total_size,
            total_batches: plan.total_batches(),
            sample_pending: imported
                .files
                .iter()
                .filter(|f| f.status != FileStatus::Completed)
                .take(5)
                .map(|f| f.seed.identity.clone())
                .collect(),
        };
        if dry_run {
            return Ok(report);
        }

        let status: HashMap<&str, FileStatus> = imported
            .files
            .iter()
            .map(|f| (f.seed.identity.as_str(), f.status))
            .collect();
        let task = self.tasks.create(imported.collection.clone(), target)?;
        self.layout.save_plan(&task.id, &plan)?;
        for batch in &plan.batches {
            let tracker = self
                .layout
                .open_tracker(&MetadataLayout::batch_scope(&task.id, batch.index))?;
            tracker.import(batch.files.iter().map(|seed| {
                let state = status
                    .get(seed.identity.as_str())
                    .copied()
                    .unwrap_or(FileStatus::Pending);
                (seed.clone(), state)
            }))?;
        }

        let all_done = report.completed_files == report.total_files;
        self.tasks.update(&task.id, |t| {
            t.download_size = plan.total_size;
            t.downloaded_size = completed_size;
            if plan.total_size > 0 {
                t.progress = completed_size as f64 / plan.total_size as f64 * 100.0;
            }
            Ok(())
        })?;
        if all_done {
            self.tasks.set_status(&task.id, TaskStatus::Completed, None)?;
        }
        info!(
            task = %task.id,
            collection = %imported.collection,
            files = report.total_files,
            completed = report.completed_files,
            batches = report.total_batches,
            "imported hfd download"
        );
        report.task_id = Some(task.id);
        Ok(report)
    }

    /// Removes a task and its metadata. Unless `keep_files` is set, the
    /// files its plan lists are deleted from the target directory as well,
    /// along with aria2c control files and directories left empty.
    pub fn delete_task(
        &self,
        task_id: &str,
        keep_files: bool,
        force: bool,
    ) -> Result<DeleteReport, ServiceError> {
        let task = self.tasks.require(task_id)?;
        if task.status == TaskStatus::Running && !force {
            return Err(ServiceError::InvalidState(format!(
                "task {task_id} is running; cancel it first or force the delete"
            )));
        }
        let plan = self.layout.load_plan(task_id)?;

        let mut report = DeleteReport {
            task_id: task_id.to_string(),
            target_dir: task.target_dir.clone(),
            kept_files: keep_files,
            removed_files: 0,
            freed_bytes: 0,
        };
        if !keep_files && let Some(plan) = &plan {
            let (removed, freed) = remove_downloads(&task.target_dir, plan)?;
            report.removed_files = removed;
            report.freed_bytes = freed;
        }

        let total = match &plan {
            Some(plan) => plan.total_batches(),
            None => task.batch.as_ref().map_or(0, |p| p.total_batches),
        };
        self.layout.remove_task(task_id, total)?;
        self.tasks.remove(task_id)?;
        info!(
            task = %task_id,
            files = report.removed_files,
            freed = %format_size(report.freed_bytes),
            kept_files = keep_files,
            "deleted task"
        );
        Ok(report)
    }

    /// Forgets completed tasks older than `keep_days`, metadata included.
    /// Downloaded files are never touched.
    pub fn clean(&self, keep_days: i64) -> Result<Vec<String>, ServiceError> {
        let removed = self.tasks.clean_completed(keep_days)?;
        let mut ids = Vec::with_capacity(removed.len());
        for task in removed {
            let total = match self.layout.load_plan(&task.id)? {
                Some(plan) => plan.total_batches(),
                None => task.batch.as_ref().map_or(0, |p| p.total_batches),
            };
            self.layout.remove_task(&task.id, total)?;
            ids.push(task.id);
        }
        Ok(ids)
    }
}

/// Deletes the plan's files under `root`, then prunes emptied directories.
/// Returns the number of files removed and their total size.
fn remove_downloads(root: &Path, plan: &BatchPlan) -> Result<(usize, u64), ServiceError> {
    let mut removed = 0;
    let mut freed = 0;
    let mut dirs = BTreeSet::new();

    for seed in plan.batches.iter().flat_map(|b| &b.files) {
        let path = root.join(&seed.identity);
        let mut control = path.as_os_str().to_owned();
        control.push(".aria2");
        for (candidate, counted) in [(path.clone(), true), (PathBuf::from(control), false)] {
            let Some(size) = probe_file(&candidate)? else {
                continue;
            };
            fs::remove_file(&candidate).map_err(ExecutorError::from)?;
            if counted {
                removed += 1;
                freed += size;
            }
        }
        dirs.extend(
            path.ancestors()
                .skip(1)
                .take_while(|d| *d != root && d.starts_with(root))
                .map(Path::to_path_buf),
        );
    }

    // Deepest first; non-empty directories are left alone.
    let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        if fs::remove_dir(&dir).is_ok() {
            debug!(dir = %dir.display(), "removed empty directory");
        }
    }
    Ok((removed, freed))
}

fn next_step_after(task_id: &str, outcome: &ExecutionOutcome) -> Option<String> {
    match outcome {
        ExecutionOutcome::Completed { .. } => None,
        ExecutionOutcome::AwaitingOperator { next_batch, .. } => Some(format!(
            "move completed files off the target disk, then run `continue {task_id} {next_batch}`"
        )),
        ExecutionOutcome::BatchFailed { .. } | ExecutionOutcome::Cancelled { .. } => {
            Some(format!("run `resume {task_id}` to retry the unfinished files"))
        }
    }
}

fn next_step_for_task(task: &Task) -> Option<String> {
    let id = &task.id;
    match (task.status, &task.batch) {
        (TaskStatus::Completed, _) => None,
        (TaskStatus::Paused, Some(p)) => Some(format!(
            "move completed files off the target disk, then run `continue {id} {}`",
            p.current_batch + 1
        )),
        (TaskStatus::Running, _) => None,
        (TaskStatus::Failed, _) if !task.can_retry() => {
            Some("retry budget exhausted; fix the cause and run `continue` on the failed batch".into())
        }
        _ => Some(format!("run `resume {id}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use batchpull_inventory::{BoxFuture, Listing, ListingError};
    use batchpull_model::CollectionKind;
    use batchpull_transfer::MovedFilesPolicy;

    use crate::agent::{AgentExit, AgentJob};
    use crate::capacity::FixedCapacity;

    struct StaticProvider(Vec<FileSeed>);

    impl ListingProvider for StaticProvider {
        fn list_files<'a>(
            &'a self,
            _collection: &'a CollectionRef,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<Listing, ListingError>> {
            Box::pin(async move {
                Ok(Listing {
                    entries: self.0.clone(),
                    reported_total: Some(self.0.len()),
                })
            })
        }
    }

    struct FailingProvider;

    impl ListingProvider for FailingProvider {
        fn list_files<'a>(
            &'a self,
            collection: &'a CollectionRef,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<Listing, ListingError>> {
            Box::pin(async move { Err(ListingError::NotFound(collection.repo_id.clone())) })
        }
    }

    /// Writes every file it is given at full size, except those listed in
    /// `skip`.
    struct DiskAgent {
        sizes: HashMap<String, usize>,
        skip: Mutex<Vec<String>>,
        delegated: Mutex<Vec<Vec<String>>>,
    }

    impl DiskAgent {
        fn new(files: &[FileSeed]) -> Self {
            Self {
                sizes: files
                    .iter()
                    .map(|f| (f.identity.clone(), f.size as usize))
                    .collect(),
                skip: Mutex::new(Vec::new()),
                delegated: Mutex::new(Vec::new()),
            }
        }

        fn skip(&self, identity: &str) {
            self.skip.lock().unwrap().push(identity.to_string());
        }

        fn clear_skips(&self) {
            self.skip.lock().unwrap().clear();
        }

        fn last_job(&self) -> Vec<String> {
            self.delegated.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    impl TransferAgent for DiskAgent {
        fn name(&self) -> &str {
            "disk"
        }

        fn run<'a>(
            &'a self,
            job: &'a AgentJob,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<AgentExit, ExecutorError>> {
            Box::pin(async move {
                let skip = self.skip.lock().unwrap().clone();
                self.delegated
                    .lock()
                    .unwrap()
                    .push(job.files.iter().map(|f| f.identity.clone()).collect());
                for file in &job.files {
                    if skip.contains(&file.identity) {
                        continue;
                    }
                    let size = self.sizes.get(&file.identity).copied().unwrap_or(0);
                    let path = job.working_dir.join(&file.identity);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(path, vec![0u8; size]).await?;
                }
                Ok(AgentExit::success())
            })
        }
    }

    fn inventory() -> Vec<FileSeed> {
        vec![
            FileSeed::new("data/a.parquet", "http://h/a", 60).unwrap(),
            FileSeed::new("data/b.parquet", "http://h/b", 50).unwrap(),
            FileSeed::new("c.json", "http://h/c", 30).unwrap(),
        ]
    }

    fn collection() -> CollectionRef {
        CollectionRef::new("org/set", CollectionKind::Dataset, "main").unwrap()
    }

    struct Fixture {
        meta: tempfile::TempDir,
        downloads: tempfile::TempDir,
        agent: Arc<DiskAgent>,
        service: BatchService,
    }

    fn fixture_with(provider: Arc<dyn ListingProvider>, policy: MovedFilesPolicy) -> Fixture {
        let meta = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::new(meta.path(), downloads.path());
        config.safety_margin = SafetyMargin::new(1.0).unwrap();
        config.min_free_space = 0;
        config.executor = ExecutorConfig {
            poll_interval: Duration::from_millis(10),
            monitor_join_timeout: Duration::from_secs(1),
            moved_files_policy: policy,
        };
        let agent = Arc::new(DiskAgent::new(&inventory()));
        let service = BatchService::new(
            config,
            provider,
            agent.clone(),
            Arc::new(FixedCapacity(100)),
        )
        .unwrap();
        Fixture {
            meta,
            downloads,
            agent,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            Arc::new(StaticProvider(inventory())),
            MovedFilesPolicy::Skip,
        )
    }

    #[tokio::test]
    async fn plan_saves_and_advises() {
        let f = fixture();
        let report = f.service.plan(&collection(), None, None).await.unwrap();
        assert_eq!(report.plan.total_batches(), 2);
        assert_eq!(report.plan.capacity, 100);
        assert!(report.saved_to.exists());
        assert!(report.saved_to.starts_with(f.meta.path()));
        assert_eq!(report.timeline.last().unwrap().cumulative_size, 140);
        assert!(report.advice.is_some());

        let report = f
            .service
            .plan(&collection(), Some(1_000), None)
            .await
            .unwrap();
        assert_eq!(report.plan.total_batches(), 1);
        assert!(report.advice.is_none());
    }

    #[tokio::test]
    async fn estimated_inventory_is_refused() {
        let f = fixture_with(Arc::new(FailingProvider), MovedFilesPolicy::Skip);
        let err = f.service.plan(&collection(), None, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::InventoryUnavailable { .. }));
        assert_eq!(err.kind(), FailureKind::Network);

        let err = f
            .service
            .execute(&collection(), None, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InventoryUnavailable { .. }));
        assert!(f.service.list(None).is_empty());

        // Analysis itself never fails.
        let analysis = f
            .service
            .analyze(&collection(), &AnalyzeOptions::default())
            .await;
        assert!(analysis.is_estimated);
    }

    #[tokio::test]
    async fn execute_pauses_then_continue_finishes() {
        let f = fixture();
        let report = f
            .service
            .execute(&collection(), None, false, None)
            .await
            .unwrap();
        assert_eq!(report.total_batches, 2);
        assert_eq!(report.status, OutcomeStatus::Success);
        assert!(matches!(
            report.outcome,
            ExecutionOutcome::AwaitingOperator { next_batch: 2, .. }
        ));
        let step = report.next_step.unwrap();
        assert!(step.contains(&format!("continue {} 2", report.task_id)));

        let target = f.downloads.path().join("org/set");
        assert!(target.join("data/a.parquet").exists());

        let status = f.service.status(&report.task_id).unwrap();
        assert_eq!(status.task.status, TaskStatus::Paused);
        assert_eq!(status.batches.len(), 2);
        assert_eq!(status.batches[0].summary.as_ref().unwrap().completed, 2);
        assert!(status.batches[1].summary.is_none());
        assert!(status.next_step.unwrap().contains("continue"));

        let report = f.service.continue_batch(&report.task_id, 2).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
        assert!(report.next_step.is_none());

        let integrity = f.service.verify(&report.task_id).unwrap();
        assert_eq!(integrity.len(), 2);
        assert!(
            integrity
                .iter()
                .all(|b| b.count(IntegrityState::Valid) == b.entries.len())
        );

        let err = f
            .service
            .continue_batch(&report.task_id, 2)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::State);
    }

    #[tokio::test]
    async fn resume_after_pause_runs_next_batch() {
        let f = fixture();
        let report = f
            .service
            .execute(&collection(), None, false, None)
            .await
            .unwrap();
        let report = f.service.resume(&report.task_id, false).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
        assert_eq!(f.agent.last_job(), vec!["data/b.parquet"]);
    }

    #[tokio::test]
    async fn resume_skips_moved_files_and_retries_missing() {
        let f = fixture();
        f.agent.skip("c.json");
        let report = f
            .service
            .execute(&collection(), None, false, None)
            .await
            .unwrap();
        assert_eq!(report.status, OutcomeStatus::Partial);
        let task_id = report.task_id;

        // The operator archives the finished file before retrying.
        let target = f.downloads.path().join("org/set");
        fs::remove_file(target.join("data/a.parquet")).unwrap();
        f.agent.clear_skips();

        let report = f.service.resume(&task_id, false).await.unwrap();
        assert!(matches!(
            report.outcome,
            ExecutionOutcome::AwaitingOperator { completed_batch: 1, .. }
        ));
        assert_eq!(f.agent.last_job(), vec!["c.json"]);

        let tracker = f
            .service
            .layout()
            .open_tracker(&MetadataLayout::batch_scope(&task_id, 1))
            .unwrap();
        assert_eq!(
            tracker.get("data/a.parquet").unwrap().status,
            FileStatus::Completed
        );
        assert_eq!(f.service.status(&task_id).unwrap().task.retry_count, 1);

        let integrity = f.service.verify(&task_id).unwrap();
        assert_eq!(integrity[0].count(IntegrityState::Missing), 1);
    }

    #[tokio::test]
    async fn redownload_policy_fetches_moved_files() {
        let f = fixture_with(
            Arc::new(StaticProvider(inventory())),
            MovedFilesPolicy::Redownload,
        );
        f.agent.skip("c.json");
        let task_id = f
            .service
            .execute(&collection(), None, false, None)
            .await
            .unwrap()
            .task_id;
        let target = f.downloads.path().join("org/set");
        fs::remove_file(target.join("data/a.parquet")).unwrap();
        f.agent.clear_skips();

        f.service.resume(&task_id, false).await.unwrap();
        assert_eq!(f.agent.last_job(), vec!["c.json", "data/a.parquet"]);
        assert!(target.join("data/a.parquet").exists());
    }

    #[tokio::test]
    async fn cancel_list_and_clean() {
        let f = fixture();
        let task_id = f
            .service
            .execute(&collection(), None, false, None)
            .await
            .unwrap()
            .task_id;
        assert_eq!(f.service.list(Some(TaskStatus::Paused)).len(), 1);

        let task = f.service.cancel(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(f.service.cancel(&task_id).unwrap_err().kind(), FailureKind::State);
        assert_eq!(f.service.stats().by_status["cancelled"], 1);

        let report = f.service.resume(&task_id, true).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));

        // Nothing is old enough yet.
        assert!(f.service.clean(7).unwrap().is_empty());
        let removed = f.service.clean(-1).unwrap();
        assert_eq!(removed, vec![task_id.clone()]);
        assert!(!f.service.layout().task_dir(&task_id).exists());
        assert!(
            !f.service
                .layout()
                .scope_dir(&MetadataLayout::batch_scope(&task_id, 1))
                .exists()
        );
        assert!(f.downloads.path().join("org/set/c.json").exists());
    }

    #[tokio::test]
    async fn relative_target_is_stored_absolute() {
        let f = fixture();
        let relative = PathBuf::from("target-relative-test");
        let report = f
            .service
            .execute(&collection(), None, true, Some(relative.clone()))
            .await
            .unwrap();
        let task = f.service.status(&report.task_id).unwrap().task;
        assert!(task.target_dir.is_absolute());
        assert!(task.target_dir.ends_with("target-relative-test"));
        assert!(task.target_dir.join("c.json").exists());
        fs::remove_dir_all(&relative).unwrap();
    }

    /// hfd state for the fixture inventory: `a` finished, `b` half done.
    fn write_hfd_download(root: &Path) {
        let dir = root.join(".hfd");
        fs::create_dir_all(&dir).unwrap();
        let mut urls = String::new();
        for seed in inventory() {
            urls.push_str(&format!(
                "https://hf-mirror.com/datasets/org/set/resolve/main/{}\n  out={}\n",
                seed.identity, seed.identity
            ));
        }
        fs::write(dir.join("aria2c_urls.txt"), urls).unwrap();
        fs::write(
            dir.join("repo_metadata.json"),
            r#"{"id": "org/set", "siblings": [
                {"rfilename": "data/a.parquet", "size": 60},
                {"rfilename": "data/b.parquet", "size": 50},
                {"rfilename": "c.json", "size": 30}]}"#,
        )
        .unwrap();
        fs::create_dir_all(root.join("data")).unwrap();
        fs::write(root.join("data/a.parquet"), [0u8; 60]).unwrap();
        fs::write(root.join("data/b.parquet"), [0u8; 20]).unwrap();
        fs::write(root.join("data/b.parquet.aria2"), b"ctl").unwrap();
    }

    #[tokio::test]
    async fn hfd_import_resumes_only_unfinished_files() {
        let f = fixture();
        let root = f.downloads.path().join("hfd-set");
        write_hfd_download(&root);

        let preview = f.service.import_hfd(&root, None, Some(100), true).unwrap();
        assert!(preview.task_id.is_none());
        assert_eq!(preview.total_files, 3);
        assert_eq!(preview.completed_files, 1);
        assert_eq!(preview.completed_size, 60);
        assert_eq!(preview.known_size, 140);
        assert!(f.service.list(None).is_empty());

        let report = f.service.import_hfd(&root, None, Some(100), false).unwrap();
        let task_id = report.task_id.unwrap();
        let task = f.service.status(&task_id).unwrap().task;
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.target_dir, root);
        assert_eq!(task.collection, collection());
        assert_eq!(task.downloaded_size, 60);

        let report = f.service.resume(&task_id, true).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
        let fetched: Vec<String> = f.agent.delegated.lock().unwrap().concat();
        assert!(!fetched.contains(&"data/a.parquet".to_string()));
        assert!(fetched.contains(&"data/b.parquet".to_string()));
        assert!(fetched.contains(&"c.json".to_string()));
        assert_eq!(fs::metadata(root.join("data/b.parquet")).unwrap().len(), 50);
    }

    #[test]
    fn hfd_import_of_a_finished_download_is_completed() {
        let f = fixture();
        let root = f.downloads.path().join("done");
        write_hfd_download(&root);
        fs::write(root.join("data/b.parquet"), [0u8; 50]).unwrap();
        fs::remove_file(root.join("data/b.parquet.aria2")).unwrap();
        fs::write(root.join("c.json"), [0u8; 30]).unwrap();

        let report = f
            .service
            .import_hfd(&root.join(".hfd"), None, None, false)
            .unwrap();
        assert_eq!(report.completed_files, 3);
        let task = f.service.status(&report.task_id.unwrap()).unwrap().task;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100.0);
    }

    #[tokio::test]
    async fn delete_task_removes_files_unless_kept() {
        let f = fixture();
        let target = f.downloads.path().join("org/set");
        let task_id = f
            .service
            .execute(&collection(), None, true, None)
            .await
            .unwrap()
            .task_id;
        fs::write(target.join("notes.txt"), b"mine").unwrap();

        let report = f.service.delete_task(&task_id, false, false).unwrap();
        assert_eq!(report.removed_files, 3);
        assert_eq!(report.freed_bytes, 140);
        assert!(!target.join("data").exists());
        assert!(target.join("notes.txt").exists());
        assert!(f.service.list(None).is_empty());
        assert!(!f.service.layout().task_dir(&task_id).exists());

        let task_id = f
            .service
            .execute(&collection(), None, true, None)
            .await
            .unwrap()
            .task_id;
        let report = f.service.delete_task(&task_id, true, false).unwrap();
        assert!(report.kept_files);
        assert_eq!(report.removed_files, 0);
        assert!(target.join("data/a.parquet").exists());
        assert_eq!(
            f.service.status(&task_id).unwrap_err().kind(),
            FailureKind::State
        );
    }

    #[tokio::test]
    async fn running_task_is_deleted_only_with_force() {
        let f = fixture();
        let task_id = f
            .service
            .execute(&collection(), None, false, None)
            .await
            .unwrap()
            .task_id;
        f.service
            .tasks
            .set_status(&task_id, TaskStatus::Running, None)
            .unwrap();

        let err = f.service.delete_task(&task_id, true, false).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
        assert_eq!(err.kind(), FailureKind::State);
        assert_eq!(
            f.service.relocate(&task_id, f.meta.path()).unwrap_err().kind(),
            FailureKind::State
        );

        f.service.delete_task(&task_id, true, true).unwrap();
        assert!(f.service.list(None).is_empty());
    }

    #[tokio::test]
    async fn resume_continues_in_relocated_directory() {
        let f = fixture();
        let report = f
            .service
            .execute(&collection(), None, false, None)
            .await
            .unwrap();
        let old = f.downloads.path().join("org/set");
        let new = f.downloads.path().join("bigger-disk");
        fs::rename(&old, &new).unwrap();

        let task = f.service.relocate(&report.task_id, &new).unwrap();
        assert_eq!(task.target_dir, new);

        let report = f.service.resume(&report.task_id, true).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
        assert_eq!(f.agent.last_job(), vec!["data/b.parquet"]);
        assert!(new.join("data/b.parquet").exists());
        assert!(!old.exists());
    }

    #[tokio::test]
    async fn unknown_task_is_a_state_failure() {
        let f = fixture();
        let err = f.service.status("task-missing").unwrap_err();
        assert_eq!(err.kind(), FailureKind::State);
        let err = f.service.resume("task-missing", false).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::State);
    }

    #[test]
    fn failure_kinds() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(
            ServiceError::from(StoreError::Io(denied)).kind(),
            FailureKind::Permission
        );
        let full = std::io::Error::other("disk full");
        assert_eq!(
            ServiceError::from(StoreError::Io(full)).kind(),
            FailureKind::Storage
        );
        let capacity = ExecutorError::CapacityInsufficient {
            batch: 1,
            required: 10,
            available: 1,
        };
        assert_eq!(ServiceError::from(capacity).kind(), FailureKind::Storage);
        assert_eq!(
            ServiceError::from(ExecutorError::TransferAgent("x".into())).kind(),
            FailureKind::Network
        );
        assert_eq!(
            ServiceError::from(ModelError::InvalidSafetyMargin(2.0)).kind(),
            FailureKind::Input
        );
        assert_eq!(FailureKind::Permission.to_string(), "permission");
    }
}
