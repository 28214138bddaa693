//! On-disk layout of the metadata directory.
//!
//! ```text
//! <root>/tasks.json
//! <root>/plans/<collection-key>.json
//! <root>/tasks/<task>/batch_progress.json
//! <root>/tasks/<task>/batch_plan.json
//! <root>/tasks/<task>_batch_<n>/file_status.json
//! <root>/tasks/<task>_batch_<n>/download_summary.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use batchpull_model::{BatchPlan, BatchProgress, CollectionRef};
use tracing::debug;

use crate::StoreError;
use crate::backend::{JsonFileBackend, read_json, write_json_atomic};
use crate::tracker::{DownloadSummary, FileTracker};

const TRACKER_FILE: &str = "file_status.json";
const SUMMARY_FILE: &str = "download_summary.json";
const PROGRESS_FILE: &str = "batch_progress.json";
const PLAN_FILE: &str = "batch_plan.json";

#[derive(Debug, Clone)]
pub struct MetadataLayout {
    root: PathBuf,
}

impl MetadataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(task_id)
    }

    /// Tracker scope for one batch of a task.
    pub fn batch_scope(task_id: &str, batch: usize) -> String {
        format!("{task_id}_batch_{batch}")
    }

    pub fn scope_dir(&self, scope: &str) -> PathBuf {
        self.root.join("tasks").join(scope)
    }

    pub fn tracker_file(&self, scope: &str) -> PathBuf {
        self.scope_dir(scope).join(TRACKER_FILE)
    }

    pub fn summary_file(&self, scope: &str) -> PathBuf {
        self.scope_dir(scope).join(SUMMARY_FILE)
    }

    pub fn progress_file(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(PROGRESS_FILE)
    }

    pub fn plan_file(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(PLAN_FILE)
    }

    pub fn collection_plan_file(&self, collection: &CollectionRef) -> PathBuf {
        self.root
            .join("plans")
            .join(format!("{}.json", collection.key()))
    }

    /// Opens the JSON-backed tracker for `scope`.
    pub fn open_tracker(&self, scope: &str) -> Result<FileTracker, StoreError> {
        FileTracker::open(scope, JsonFileBackend::new(self.tracker_file(scope)))
    }

    pub fn save_progress(&self, progress: &BatchProgress) -> Result<(), StoreError> {
        write_json_atomic(&self.progress_file(&progress.task_id), progress)
    }

    pub fn load_progress(&self, task_id: &str) -> Result<Option<BatchProgress>, StoreError> {
        read_json(&self.progress_file(task_id))
    }

    pub fn save_plan(&self, task_id: &str, plan: &BatchPlan) -> Result<(), StoreError> {
        write_json_atomic(&self.plan_file(task_id), plan)
    }

    pub fn load_plan(&self, task_id: &str) -> Result<Option<BatchPlan>, StoreError> {
        read_json(&self.plan_file(task_id))
    }

    pub fn save_collection_plan(
        &self,
        collection: &CollectionRef,
        plan: &BatchPlan,
    ) -> Result<PathBuf, StoreError> {
        let path = self.collection_plan_file(collection);
        write_json_atomic(&path, plan)?;
        Ok(path)
    }

    pub fn load_collection_plan(
        &self,
        collection: &CollectionRef,
    ) -> Result<Option<BatchPlan>, StoreError> {
        read_json(&self.collection_plan_file(collection))
    }

    pub fn write_summary(&self, summary: &DownloadSummary) -> Result<(), StoreError> {
        write_json_atomic(&self.summary_file(&summary.scope), summary)
    }

    pub fn load_summary(&self, scope: &str) -> Result<Option<DownloadSummary>, StoreError> {
        read_json(&self.summary_file(scope))
    }

    /// Removes all metadata of a task, including its per-batch scopes.
    pub fn remove_task(&self, task_id: &str, total_batches: usize) -> Result<(), StoreError> {
        let mut dirs = vec![self.task_dir(task_id)];
        dirs.extend((1..=total_batches).map(|n| self.scope_dir(&Self::batch_scope(task_id, n))));
        for dir in dirs {
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(dir = %dir.display(), "removed task metadata"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchpull_model::{Batch, CollectionKind, FileSeed, PlanStrategy, SafetyMargin};
    use chrono::Utc;

    fn plan() -> BatchPlan {
        let files = vec![FileSeed::new("a", "u", 5).unwrap()];
        BatchPlan {
            strategy: PlanStrategy::SingleBatch,
            batches: vec![Batch::new(1, files)],
            capacity: 10,
            safety_margin: SafetyMargin::default(),
            safe_capacity: 9,
            total_size: 5,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn paths_follow_layout() {
        let layout = MetadataLayout::new("/meta");
        assert_eq!(layout.tasks_file(), PathBuf::from("/meta/tasks.json"));
        assert_eq!(
            layout.tracker_file(&MetadataLayout::batch_scope("t1", 2)),
            PathBuf::from("/meta/tasks/t1_batch_2/file_status.json")
        );
        assert_eq!(
            layout.progress_file("t1"),
            PathBuf::from("/meta/tasks/t1/batch_progress.json")
        );
    }

    #[test]
    fn plan_and_progress_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = MetadataLayout::new(tmp.path());
        assert!(layout.load_plan("t1").unwrap().is_none());
        assert!(layout.load_progress("t1").unwrap().is_none());

        let plan = plan();
        layout.save_plan("t1", &plan).unwrap();
        assert_eq!(layout.load_plan("t1").unwrap().unwrap(), plan);

        let progress = BatchProgress::new("t1", &plan.batches[0], 1);
        layout.save_progress(&progress).unwrap();
        assert_eq!(layout.load_progress("t1").unwrap().unwrap(), progress);
    }

    #[test]
    fn collection_plan_is_keyed_by_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = MetadataLayout::new(tmp.path());
        let c = CollectionRef::new("org/set", CollectionKind::Dataset, "main").unwrap();
        let path = layout.save_collection_plan(&c, &plan()).unwrap();
        assert!(path.starts_with(tmp.path().join("plans")));
        assert!(layout.load_collection_plan(&c).unwrap().is_some());
    }

    #[test]
    fn remove_task_drops_batch_scopes() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = MetadataLayout::new(tmp.path());
        layout.save_plan("t1", &plan()).unwrap();
        let tracker = layout
            .open_tracker(&MetadataLayout::batch_scope("t1", 1))
            .unwrap();
        tracker
            .initialize(&[FileSeed::new("a", "u", 5).unwrap()])
            .unwrap();

        layout.remove_task("t1", 1).unwrap();
        assert!(!layout.task_dir("t1").exists());
        assert!(!layout.scope_dir("t1_batch_1").exists());
        layout.remove_task("t1", 1).unwrap();
    }
}
