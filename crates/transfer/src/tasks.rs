//! Persistent task registry.
//!
//! `tasks.json` is shared by every batchpull process using the same
//! metadata directory. Changes take an exclusive lock on `tasks.json.lock`,
//! re-read the file, apply and write it back. Reads go to disk too; the
//! in-memory copy is only a fallback.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use batchpull_model::{BatchProgress, CollectionRef, Task, TaskStatus};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::StoreError;
use crate::backend::{read_json, write_json_atomic};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

pub struct TaskStore {
    path: PathBuf,
    tasks: RwLock<BTreeMap<String, Task>>,
}

impl TaskStore {
    /// Opens the registry, loading existing tasks from disk.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tasks = load_tasks(&path)?;
        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    /// Current registry contents as found on disk.
    fn snapshot(&self) -> BTreeMap<String, Task> {
        match load_tasks(&self.path) {
            Ok(tasks) => {
                *self.tasks.write().unwrap_or_else(PoisonError::into_inner) = tasks.clone();
                tasks
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "task registry unreadable, using cached copy"
                );
                self.tasks
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            }
        }
    }

    /// Read-modify-write of the whole registry under the cross-process lock.
    fn modify<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Task>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut cached = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let _lock = lock_registry(&self.path)?;
        let mut next = load_tasks(&self.path)?;
        let out = f(&mut next)?;
        self.persist(&next)?;
        *cached = next;
        Ok(out)
    }

    /// Registers a new pending task with a fresh id.
    pub fn create(
        &self,
        collection: CollectionRef,
        target_dir: PathBuf,
    ) -> Result<Task, StoreError> {
        let id = format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let task = Task::new(id, collection, target_dir);
        self.modify(|tasks| {
            tasks.insert(task.id.clone(), task.clone());
            Ok(())
        })?;
        info!(task = %task.id, collection = %task.collection, "created task");
        Ok(task)
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.snapshot().remove(task_id)
    }

    pub fn require(&self, task_id: &str) -> Result<Task, StoreError> {
        self.get(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    /// Applies `f` to a task and persists the result.
    pub fn update(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> Result<(), StoreError>,
    ) -> Result<Task, StoreError> {
        self.modify(|tasks| {
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
            f(task)?;
            Ok(task.clone())
        })
    }

    /// Sets the task status, stamping start and finish times.
    pub fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, StoreError> {
        let task = self.update(task_id, |task| {
            let now = Utc::now();
            match status {
                TaskStatus::Running => {
                    if task.started_at.is_none() {
                        task.started_at = Some(now);
                    }
                    task.completed_at = None;
                }
                TaskStatus::Completed => {
                    task.progress = 100.0;
                    task.eta_secs = None;
                    task.completed_at = Some(now);
                }
                TaskStatus::Failed | TaskStatus::Cancelled => task.completed_at = Some(now),
                TaskStatus::Pending | TaskStatus::Paused => {}
            }
            task.status = status;
            task.error_message = error;
            Ok(())
        })?;
        debug!(task = %task_id, status = %status, "task status updated");
        Ok(task)
    }

    pub fn set_batch_progress(
        &self,
        task_id: &str,
        progress: BatchProgress,
    ) -> Result<Task, StoreError> {
        self.update(task_id, |task| {
            task.batch = Some(progress);
            Ok(())
        })
    }

    /// Records transfer figures reported by the monitor.
    pub fn record_transfer(
        &self,
        task_id: &str,
        progress: f64,
        downloaded: u64,
        speed: f64,
        eta_secs: Option<u64>,
    ) -> Result<Task, StoreError> {
        self.update(task_id, |task| {
            task.progress = progress.clamp(0.0, 100.0);
            task.downloaded_size = downloaded;
            task.download_speed = speed;
            task.eta_secs = eta_secs;
            Ok(())
        })
    }

    /// Marks a non-terminal task cancelled.
    pub fn cancel(&self, task_id: &str) -> Result<Task, StoreError> {
        let task = self.update(task_id, |task| {
            if task.status.is_terminal() {
                return Err(StoreError::InvalidTaskState {
                    task_id: task.id.clone(),
                    status: task.status,
                    action: "cancel",
                });
            }
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            Ok(())
        })?;
        info!(task = %task_id, "task cancelled");
        Ok(task)
    }

    /// Puts a failed task back to pending, within its retry budget.
    pub fn retry(&self, task_id: &str) -> Result<Task, StoreError> {
        self.update(task_id, |task| {
            if !task.can_retry() {
                return Err(StoreError::InvalidTaskState {
                    task_id: task.id.clone(),
                    status: task.status,
                    action: "retry",
                });
            }
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.error_message = None;
            task.completed_at = None;
            Ok(())
        })
    }

    /// All tasks, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .snapshot()
            .into_values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub fn remove(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let removed = self.modify(|tasks| Ok(tasks.remove(task_id)))?;
        if removed.is_some() {
            info!(task = %task_id, "removed task");
        }
        Ok(removed)
    }

    /// Drops completed tasks finished more than `keep_days` ago.
    pub fn clean_completed(&self, keep_days: i64) -> Result<Vec<Task>, StoreError> {
        let cutoff = Utc::now() - Duration::days(keep_days);
        let old = self.modify(|tasks| {
            let (old, keep): (BTreeMap<_, _>, BTreeMap<_, _>) =
                std::mem::take(tasks).into_iter().partition(|(_, t)| {
                    t.status == TaskStatus::Completed
                        && t.completed_at.is_some_and(|c| c < cutoff)
                });
            *tasks = keep;
            Ok(old)
        })?;
        if !old.is_empty() {
            info!(removed = old.len(), keep_days, "cleaned completed tasks");
        }
        Ok(old.into_values().collect())
    }

    pub fn stats(&self) -> TaskStats {
        let tasks = self.snapshot();
        let mut stats = TaskStats {
            total: tasks.len(),
            ..TaskStats::default()
        };
        for task in tasks.values() {
            *stats
                .by_status
                .entry(task.status.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }

    fn persist(&self, tasks: &BTreeMap<String, Task>) -> Result<(), StoreError> {
        write_json_atomic(&self.path, tasks)?;
        debug!("persisted {} task(s) to {:?}", tasks.len(), self.path);
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(unix)]
type RegistryLock = nix::fcntl::Flock<File>;
#[cfg(not(unix))]
type RegistryLock = File;

/// Blocks until this handle holds the registry lock; released on drop.
fn lock_registry(path: &Path) -> Result<RegistryLock, StoreError> {
    let lock_path = lock_path(path);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    #[cfg(unix)]
    {
        nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
            .map_err(|(_, errno)| StoreError::Io(std::io::Error::from(errno)))
    }
    #[cfg(not(unix))]
    {
        Ok(file)
    }
}

fn load_tasks(path: &Path) -> Result<BTreeMap<String, Task>, StoreError> {
    let tasks: BTreeMap<String, Task> = read_json(path)?.unwrap_or_default();
    debug!("loaded {} task(s) from {:?}", tasks.len(), path);
    Ok(tasks)
}
