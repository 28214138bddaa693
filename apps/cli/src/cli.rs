//! Argument parsing and command dispatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use batchpull_executor::{Aria2cAgent, BatchService, OutcomeStatus, StatvfsProbe};
use batchpull_inventory::{AnalyzeOptions, HubListingProvider};
use batchpull_model::{CollectionKind, CollectionRef, SafetyMargin, TaskStatus};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::AppConfig;
use crate::output;

#[derive(Debug, Parser)]
#[command(
    name = "batchpull",
    version,
    about = "Download huge remote collections in batches that fit the disk"
)]
pub struct Cli {
    /// Config file (default: ~/.config/batchpull/config.json).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub metadata_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub downloads_dir: Option<PathBuf>,

    /// Content host endpoint.
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enumerate a collection and summarise its size.
    Analyze(AnalyzeArgs),
    /// Partition a collection into batches for a capacity.
    Plan(PlanArgs),
    /// Create a task and start downloading.
    Execute(ExecuteArgs),
    /// Run one batch of an existing task.
    Continue(ContinueArgs),
    /// Pick up a paused, failed or interrupted task.
    Resume(ResumeArgs),
    /// Show a task and its batches.
    Status(TaskArg),
    /// Mark a task cancelled.
    Cancel(TaskArg),
    /// Compare tracked files against the disk.
    Verify(TaskArg),
    /// List tasks.
    List(ListArgs),
    /// Forget old completed tasks.
    Clean(CleanArgs),
    /// Remove a task, and its downloaded files unless told to keep them.
    DeleteTask(DeleteTaskArgs),
    /// Adopt a download started with hfd as a new task.
    ImportHfd(ImportHfdArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Dataset,
    Model,
}

impl From<KindArg> for CollectionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Dataset => CollectionKind::Dataset,
            KindArg::Model => CollectionKind::Model,
        }
    }
}

#[derive(Debug, Args)]
pub struct CollectionArgs {
    /// Repository id, e.g. `org/name`.
    pub repo_id: String,

    #[arg(long, value_enum, default_value_t = KindArg::Dataset)]
    pub kind: KindArg,

    #[arg(long, default_value = "main")]
    pub revision: String,
}

impl CollectionArgs {
    fn collection(&self) -> anyhow::Result<CollectionRef> {
        Ok(CollectionRef::new(
            &self.repo_id,
            self.kind.into(),
            &self.revision,
        )?)
    }
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub collection: CollectionArgs,

    /// Sample sizes instead of summing every file.
    #[arg(long)]
    pub quick: bool,

    #[arg(long)]
    pub sample_size: Option<usize>,

    /// Give up enumerating after this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub collection: CollectionArgs,

    /// Storage budget, e.g. `500G` (default: free space at the downloads dir).
    #[arg(long, value_parser = parse_size)]
    pub capacity: Option<u64>,

    /// Fraction of the capacity to fill, in (0, 1].
    #[arg(long)]
    pub margin: Option<f64>,
}

#[derive(Debug, Args)]
pub struct ExecuteArgs {
    #[command(flatten)]
    pub collection: CollectionArgs,

    #[arg(long, value_parser = parse_size)]
    pub capacity: Option<u64>,

    /// Run every batch without pausing in between.
    #[arg(long)]
    pub auto: bool,

    /// Download directory (default: <downloads-dir>/<repo-id>).
    #[arg(long)]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ContinueArgs {
    pub task_id: String,
    /// 1-based batch number.
    pub batch: usize,
}

#[derive(Debug, Args)]
pub struct ResumeArgs {
    pub task_id: String,

    #[arg(long)]
    pub auto: bool,

    /// Continue in this directory, e.g. after moving the partial download.
    #[arg(long)]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DeleteTaskArgs {
    pub task_id: String,

    /// Leave downloaded files on disk.
    #[arg(long)]
    pub keep_files: bool,

    /// Delete even if the task is marked running.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct ImportHfdArgs {
    /// hfd download directory or its `.hfd` subdirectory.
    pub source: PathBuf,

    /// Where the files live (default: the directory holding `.hfd`).
    #[arg(long)]
    pub target: Option<PathBuf>,

    #[arg(long, value_parser = parse_size)]
    pub capacity: Option<u64>,

    /// Report what would be imported without creating a task.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct TaskArg {
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusArg> for TaskStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Pending => TaskStatus::Pending,
            StatusArg::Running => TaskStatus::Running,
            StatusArg::Paused => TaskStatus::Paused,
            StatusArg::Completed => TaskStatus::Completed,
            StatusArg::Failed => TaskStatus::Failed,
            StatusArg::Cancelled => TaskStatus::Cancelled,
        }
    }
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, value_enum)]
    pub status: Option<StatusArg>,
}

#[derive(Debug, Args)]
pub struct CleanArgs {
    /// Keep completed tasks finished within this many days.
    #[arg(long, default_value_t = 7)]
    pub keep_days: i64,
}

/// Parses `1024`, `500M`, `1.5T`, `2GiB`. Units are binary.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid size: {input}"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        other => return Err(format!("unknown size unit: {other}")),
    };
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(format!("size out of range: {input}"));
    }
    Ok(bytes as u64)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(dir) = &cli.metadata_dir {
        config.metadata_dir = dir.clone();
    }
    if let Some(dir) = &cli.downloads_dir {
        config.downloads_dir = dir.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    Ok(config)
}

fn build_service(config: &AppConfig) -> anyhow::Result<BatchService> {
    let provider = HubListingProvider::new(
        &config.endpoint,
        config.token.clone(),
        Duration::from_secs(config.request_timeout_secs.max(1)),
    )?;
    let agent = Aria2cAgent::new(config.agent_options());
    let service = BatchService::new(
        config.service_config()?,
        Arc::new(provider),
        Arc::new(agent),
        Arc::new(StatvfsProbe),
    )
    .context("failed to open metadata directory")?;
    Ok(service)
}

/// Runs the parsed command and returns how it went.
pub async fn run(cli: Cli) -> anyhow::Result<OutcomeStatus> {
    let config = load_config(&cli)?;
    let service = build_service(&config)?;

    let cancel = service.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping");
            cancel.cancel();
        }
    });

    let json = cli.json;
    match cli.command {
        Command::Analyze(args) => {
            let collection = args.collection.collection()?;
            let defaults = config.service_config()?.analyze;
            let options = AnalyzeOptions {
                quick: args.quick,
                sample_size: args.sample_size.unwrap_or(defaults.sample_size).max(1),
                timeout: args
                    .timeout
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
                large_collection_threshold: defaults.large_collection_threshold,
            };
            let analysis = service.analyze(&collection, &options).await;
            output::analysis(&analysis, json)?;
            Ok(if analysis.is_actionable() {
                OutcomeStatus::Success
            } else {
                OutcomeStatus::Partial
            })
        }
        Command::Plan(args) => {
            let collection = args.collection.collection()?;
            let margin = args.margin.map(SafetyMargin::new).transpose()?;
            let report = service.plan(&collection, args.capacity, margin).await?;
            output::plan(&report, json)?;
            Ok(OutcomeStatus::Success)
        }
        Command::Execute(args) => {
            let collection = args.collection.collection()?;
            let report = service
                .execute(&collection, args.capacity, args.auto, args.target)
                .await?;
            output::execution(&report, json)?;
            Ok(report.status)
        }
        Command::Continue(args) => {
            let report = service.continue_batch(&args.task_id, args.batch).await?;
            output::execution(&report, json)?;
            Ok(report.status)
        }
        Command::Resume(args) => {
            if let Some(target) = &args.target {
                service.relocate(&args.task_id, target)?;
            }
            let report = service.resume(&args.task_id, args.auto).await?;
            output::execution(&report, json)?;
            Ok(report.status)
        }
        Command::Status(args) => {
            let report = service.status(&args.task_id)?;
            output::status(&report, json)?;
            Ok(report.status)
        }
        Command::Cancel(args) => {
            let task = service.cancel(&args.task_id)?;
            output::task_line(&task, json)?;
            Ok(OutcomeStatus::Success)
        }
        Command::Verify(args) => {
            let batches = service.verify(&args.task_id)?;
            let status = output::verification(&batches, json)?;
            Ok(status)
        }
        Command::List(args) => {
            let tasks = service.list(args.status.map(Into::into));
            output::task_list(&tasks, &service.stats(), json)?;
            Ok(OutcomeStatus::Success)
        }
        Command::Clean(args) => {
            let removed = service.clean(args.keep_days)?;
            output::cleaned(&removed, json)?;
            Ok(OutcomeStatus::Success)
        }
        Command::DeleteTask(args) => {
            let report = service.delete_task(&args.task_id, args.keep_files, args.force)?;
            output::deleted(&report, json)?;
            Ok(OutcomeStatus::Success)
        }
        Command::ImportHfd(args) => {
            let report =
                service.import_hfd(&args.source, args.target, args.capacity, args.dry_run)?;
            output::imported(&report, json)?;
            Ok(OutcomeStatus::Success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse_with_binary_units() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("500M").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size("2GiB").unwrap(), 2 << 30);
        assert_eq!(parse_size("1.5t").unwrap(), (1.5 * (1u64 << 40) as f64) as u64);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("5X").is_err());
    }

    #[test]
    fn parses_execute_with_globals() {
        let cli = Cli::try_parse_from([
            "batchpull",
            "execute",
            "org/set",
            "--capacity",
            "100G",
            "--auto",
            "--metadata-dir",
            "/meta",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.metadata_dir, Some(PathBuf::from("/meta")));
        let Command::Execute(args) = cli.command else {
            panic!("expected execute");
        };
        assert!(args.auto);
        assert_eq!(args.capacity, Some(100 << 30));
        let collection = args.collection.collection().unwrap();
        assert_eq!(collection.kind, CollectionKind::Dataset);
        assert_eq!(collection.revision, "main");
    }

    #[test]
    fn parses_continue_and_list() {
        let cli = Cli::try_parse_from(["batchpull", "continue", "task-abc", "3"]).unwrap();
        let Command::Continue(args) = cli.command else {
            panic!("expected continue");
        };
        assert_eq!(args.batch, 3);

        let cli = Cli::try_parse_from(["batchpull", "list", "--status", "paused"]).unwrap();
        let Command::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.status.map(TaskStatus::from), Some(TaskStatus::Paused));
    }

    #[test]
    fn model_kind_and_missing_args() {
        let cli =
            Cli::try_parse_from(["batchpull", "plan", "org/m", "--kind", "model"]).unwrap();
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(
            args.collection.collection().unwrap().kind,
            CollectionKind::Model
        );
        assert!(Cli::try_parse_from(["batchpull", "continue", "task-abc"]).is_err());
    }

    #[test]
    fn parses_task_housekeeping() {
        let cli = Cli::try_parse_from([
            "batchpull",
            "import-hfd",
            "/data/set",
            "--capacity",
            "2T",
            "--dry-run",
        ])
        .unwrap();
        let Command::ImportHfd(args) = cli.command else {
            panic!("expected import-hfd");
        };
        assert_eq!(args.source, PathBuf::from("/data/set"));
        assert_eq!(args.capacity, Some(2 << 40));
        assert!(args.dry_run);
        assert!(args.target.is_none());

        let cli =
            Cli::try_parse_from(["batchpull", "delete-task", "task-abc", "--keep-files"]).unwrap();
        let Command::DeleteTask(args) = cli.command else {
            panic!("expected delete-task");
        };
        assert!(args.keep_files);
        assert!(!args.force);

        let cli = Cli::try_parse_from(["batchpull", "resume", "task-abc", "--target", "/mnt/b"])
            .unwrap();
        let Command::Resume(args) = cli.command else {
            panic!("expected resume");
        };
        assert_eq!(args.target, Some(PathBuf::from("/mnt/b")));
    }
}
