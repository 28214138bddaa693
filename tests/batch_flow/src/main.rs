fn main() {
    println!("Run `cargo test -p batch-flow` to execute the end-to-end batch tests.");
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use batchpull_executor::{
        AgentExit, AgentJob, BatchService, ExecutionOutcome, ExecutorConfig, ExecutorError,
        FailureKind, FixedCapacity, OutcomeStatus, ServiceConfig, TransferAgent,
    };
    use batchpull_inventory::{BoxFuture, Listing, ListingError, ListingProvider};
    use batchpull_model::{CollectionKind, CollectionRef, FileSeed, SafetyMargin, TaskStatus};
    use batchpull_transfer::{IntegrityState, MovedFilesPolicy};
    use tokio_util::sync::CancellationToken;

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

    /// Writes each delegated file at its listed size unless told to withhold it.
    struct ScriptedAgent {
        sizes: HashMap<String, usize>,
        withheld: Mutex<HashSet<String>>,
        jobs: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedAgent {
        fn new(files: &[FileSeed]) -> Self {
            Self {
                sizes: files
                    .iter()
                    .map(|f| (f.identity.clone(), f.size as usize))
                    .collect(),
                withheld: Mutex::new(HashSet::new()),
                jobs: Mutex::new(Vec::new()),
            }
        }

        fn withhold(&self, identity: &str) {
            self.withheld.lock().unwrap().insert(identity.to_string());
        }

        fn release_all(&self) {
            self.withheld.lock().unwrap().clear();
        }

        fn jobs(&self) -> Vec<Vec<String>> {
            self.jobs.lock().unwrap().clone()
        }
    }

    impl TransferAgent for ScriptedAgent {
        fn name(&self) -> &str {
            "scripted"
        }

        fn run<'a>(
            &'a self,
            job: &'a AgentJob,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<AgentExit, ExecutorError>> {
            Box::pin(async move {
                let withheld = self.withheld.lock().unwrap().clone();
                self.jobs
                    .lock()
                    .unwrap()
                    .push(job.files.iter().map(|f| f.identity.clone()).collect());
                for file in &job.files {
                    if withheld.contains(&file.identity) {
                        continue;
                    }
                    let path = job.working_dir.join(&file.identity);
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let size = self.sizes.get(&file.identity).copied().unwrap_or(0);
                    tokio::fs::write(path, vec![7u8; size]).await?;
                }
                Ok(AgentExit::success())
            })
        }
    }

    fn inventory() -> Vec<FileSeed> {
        vec![
            FileSeed::new("train/shard-0.bin", "http://host/0", 60).unwrap(),
            FileSeed::new("train/shard-1.bin", "http://host/1", 60).unwrap(),
            FileSeed::new("train/shard-2.bin", "http://host/2", 60).unwrap(),
            FileSeed::new("meta.json", "http://host/meta", 30).unwrap(),
        ]
    }

    fn collection() -> CollectionRef {
        CollectionRef::new("org/corpus", CollectionKind::Dataset, "main").unwrap()
    }

    /// A fresh service over the same directories, as after a process restart.
    fn open_service(
        meta: &Path,
        downloads: &Path,
        agent: Arc<ScriptedAgent>,
        capacity: u64,
    ) -> BatchService {
        let mut config = ServiceConfig::new(meta, downloads);
        config.safety_margin = SafetyMargin::new(1.0).unwrap();
        config.min_free_space = 0;
        config.executor = ExecutorConfig {
            poll_interval: Duration::from_millis(10),
            monitor_join_timeout: Duration::from_secs(1),
            moved_files_policy: MovedFilesPolicy::Skip,
        };
        BatchService::new(
            config,
            Arc::new(StaticProvider(inventory())),
            agent,
            Arc::new(FixedCapacity(capacity)),
        )
        .unwrap()
    }

    fn identities(service: &BatchService, task_id: &str, batch: usize) -> Vec<String> {
        let plan = service.layout().load_plan(task_id).unwrap().unwrap();
        let mut ids: Vec<String> = plan
            .batch(batch)
            .unwrap()
            .files
            .iter()
            .map(|f| f.identity.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The operator moves a finished batch off the target disk.
    fn archive(root: &Path, ids: &[String]) {
        for id in ids {
            let path: PathBuf = root.join(id);
            assert!(path.exists(), "{id} should have been downloaded");
            std::fs::remove_file(path).unwrap();
        }
    }

    #[tokio::test]
    async fn multi_batch_run_survives_restarts_and_failures() {
        let meta = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let agent = Arc::new(ScriptedAgent::new(&inventory()));
        let target = downloads.path().join("org/corpus");

        // First batch, then pause for the operator.
        let service = open_service(meta.path(), downloads.path(), agent.clone(), 100);
        let report = service
            .execute(&collection(), None, false, None)
            .await
            .unwrap();
        assert_eq!(report.total_batches, 3);
        assert_eq!(
            report.outcome,
            ExecutionOutcome::AwaitingOperator {
                completed_batch: 1,
                next_batch: 2,
                total_batches: 3,
            }
        );
        let task_id = report.task_id.clone();
        let batch_one = identities(&service, &task_id, 1);
        archive(&target, &batch_one);
        drop(service);

        // Restart and resume: the paused task moves on to batch 2.
        let service = open_service(meta.path(), downloads.path(), agent.clone(), 100);
        let status = service.status(&task_id).unwrap();
        assert_eq!(status.task.status, TaskStatus::Paused);
        assert_eq!(status.task.batch.as_ref().unwrap().current_batch, 1);

        let report = service.resume(&task_id, false).await.unwrap();
        assert!(matches!(
            report.outcome,
            ExecutionOutcome::AwaitingOperator {
                completed_batch: 2,
                next_batch: 3,
                ..
            }
        ));
        let mut last = agent.jobs().last().cloned().unwrap();
        last.sort();
        assert_eq!(last, identities(&service, &task_id, 2));
        archive(&target, &identities(&service, &task_id, 2));

        // Batch 3 loses one file.
        let batch_three = identities(&service, &task_id, 3);
        assert_eq!(batch_three.len(), 2);
        let lost = batch_three[0].clone();
        agent.withhold(&lost);

        let report = service.continue_batch(&task_id, 3).await.unwrap();
        assert_eq!(report.status, OutcomeStatus::Partial);
        assert!(matches!(
            report.outcome,
            ExecutionOutcome::BatchFailed {
                batch: 3,
                completed: 1,
                failed: 1,
                ..
            }
        ));

        let status = service.status(&task_id).unwrap();
        assert_eq!(status.task.status, TaskStatus::Failed);
        assert_eq!(status.status, OutcomeStatus::Partial);
        assert_eq!(status.batches[2].failed_files.len(), 1);
        assert_eq!(status.batches[2].failed_files[0].identity, lost);
        drop(service);

        // Restart again; only the lost file is fetched.
        agent.release_all();
        let service = open_service(meta.path(), downloads.path(), agent.clone(), 100);
        let report = service.resume(&task_id, true).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));
        assert_eq!(agent.jobs().last().cloned().unwrap(), vec![lost.clone()]);

        let status = service.status(&task_id).unwrap();
        assert_eq!(status.task.status, TaskStatus::Completed);
        assert_eq!(status.task.retry_count, 1);
        assert_eq!(status.status, OutcomeStatus::Success);
        assert!(status.next_step.is_none());

        // Archived batches read as missing; the last one is intact.
        let integrity = service.verify(&task_id).unwrap();
        assert_eq!(integrity.len(), 3);
        assert_eq!(integrity[0].count(IntegrityState::Missing), batch_one.len());
        assert_eq!(integrity[2].count(IntegrityState::Valid), 2);
    }

    #[tokio::test]
    async fn capacity_shortfall_is_recoverable() {
        let meta = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let agent = Arc::new(ScriptedAgent::new(&inventory()));

        let service = open_service(meta.path(), downloads.path(), agent.clone(), 100);
        let task_id = service
            .execute(&collection(), None, false, None)
            .await
            .unwrap()
            .task_id;
        let batch_one = identities(&service, &task_id, 1);
        drop(service);

        // The disk filled up in the meantime.
        let service = open_service(meta.path(), downloads.path(), agent.clone(), 10);
        let err = service.continue_batch(&task_id, 2).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Storage);
        let task = service.status(&task_id).unwrap().task;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.batch.unwrap().current_batch, 2);
        assert_eq!(agent.jobs().len(), 1);
        drop(service);

        // Space is back; resume starts at the batch that never ran.
        let service = open_service(meta.path(), downloads.path(), agent.clone(), 100);
        let report = service.resume(&task_id, true).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Completed { .. }));

        let jobs = agent.jobs();
        assert_eq!(jobs.len(), 3);
        let mut second = jobs[1].clone();
        second.sort();
        assert_eq!(second, identities(&service, &task_id, 2));
        let refetched: Vec<String> = jobs[1..].iter().flatten().cloned().collect();
        assert!(refetched.iter().all(|id| !batch_one.contains(id)));
        assert_eq!(refetched.len(), inventory().len() - batch_one.len());
        assert_eq!(
            service.status(&task_id).unwrap().task.status,
            TaskStatus::Completed
        );
    }
}
