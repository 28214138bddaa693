//! Transfer agent seam and the aria2c implementation.
//!
//! The agent owns byte transfer, retries and connection parallelism. The
//! executor hands it `(locator, identity)` pairs and only looks at the
//! exit code and at what lands on disk.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use batchpull_inventory::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ExecutorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFile {
    pub locator: String,
    /// Relative output path under the working directory.
    pub identity: String,
}

/// One delegation: the pending files of one batch.
#[derive(Debug, Clone)]
pub struct AgentJob {
    pub task_id: String,
    pub batch: usize,
    pub working_dir: PathBuf,
    pub files: Vec<AgentFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    /// Process exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    pub cancelled: bool,
}

impl AgentExit {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            cancelled: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0) && !self.cancelled
    }
}

/// Moves bytes for a job into its working directory.
///
/// Implementations must stop promptly once `cancel` fires and report
/// `cancelled: true`.
pub trait TransferAgent: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(
        &'a self,
        job: &'a AgentJob,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<AgentExit, ExecutorError>>;
}

// ---------------------------------------------------------------------------
// aria2c
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aria2cOptions {
    pub program: String,
    pub max_concurrent_downloads: u32,
    pub split: u32,
    pub max_connection_per_server: u32,
    pub max_tries: u32,
    pub retry_wait_secs: u32,
    /// Sent as `Authorization: Bearer …` when set.
    #[serde(skip)]
    pub auth_token: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for Aria2cOptions {
    fn default() -> Self {
        Self {
            program: "aria2c".into(),
            max_concurrent_downloads: 8,
            split: 5,
            max_connection_per_server: 5,
            max_tries: 5,
            retry_wait_secs: 3,
            auth_token: None,
            extra_args: Vec::new(),
        }
    }
}

/// Runs `aria2c` against an input file listing the job's files.
pub struct Aria2cAgent {
    options: Aria2cOptions,
}

impl Aria2cAgent {
    pub fn new(options: Aria2cOptions) -> Self {
        Self { options }
    }

    fn input_file(dir: &Path, job: &AgentJob) -> PathBuf {
        dir.join(format!("{}_batch_{}_input.txt", job.task_id, job.batch))
    }

    /// aria2c input format: the URL, then indented per-download options.
    fn input_contents(job: &AgentJob) -> String {
        let mut out = String::new();
        for file in &job.files {
            out.push_str(&file.locator);
            out.push('\n');
            out.push_str("  out=");
            out.push_str(&file.identity);
            out.push_str("\n\n");
        }
        out
    }

    fn args(&self, input: &Path) -> Vec<String> {
        let o = &self.options;
        let mut args = vec![
            "--console-log-level=warn".to_string(),
            "--summary-interval=10".to_string(),
            "--file-allocation=none".to_string(),
            format!("--retry-wait={}", o.retry_wait_secs),
            format!("--max-tries={}", o.max_tries),
            format!("--split={}", o.split),
            format!("--max-concurrent-downloads={}", o.max_concurrent_downloads),
            "--continue=true".to_string(),
            format!("--max-connection-per-server={}", o.max_connection_per_server),
            "--auto-file-renaming=false".to_string(),
            "--conditional-get=true".to_string(),
            "--allow-overwrite=true".to_string(),
        ];
        if let Some(token) = o.auth_token.as_deref().filter(|t| !t.is_empty()) {
            args.push("--header".to_string());
            args.push(format!("Authorization: Bearer {token}"));
        }
        args.extend(o.extra_args.iter().cloned());
        args.push("-i".to_string());
        args.push(input.display().to_string());
        args
    }

    async fn run_job(
        &self,
        job: &AgentJob,
        cancel: CancellationToken,
    ) -> Result<AgentExit, ExecutorError> {
        // aria2c runs inside the working directory, so the input path it is
        // handed must not depend on the caller's cwd.
        let working_dir = std::path::absolute(&job.working_dir)?;
        tokio::fs::create_dir_all(&working_dir).await?;
        let input = Self::input_file(&working_dir, job);
        tokio::fs::write(&input, Self::input_contents(job)).await?;

        let result = self.spawn_and_wait(job, &working_dir, &input, cancel).await;

        if let Err(e) = tokio::fs::remove_file(&input).await {
            warn!(path = %input.display(), error = %e, "failed to remove aria2c input file");
        }
        result
    }

    async fn spawn_and_wait(
        &self,
        job: &AgentJob,
        working_dir: &Path,
        input: &Path,
        cancel: CancellationToken,
    ) -> Result<AgentExit, ExecutorError> {
        let mut child = Command::new(&self.options.program)
            .args(self.args(input))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::TransferAgent(format!(
                    "failed to start {}: {e}",
                    self.options.program
                ))
            })?;

        info!(
            task = %job.task_id,
            batch = job.batch,
            files = job.files.len(),
            pid = child.id(),
            "started aria2c"
        );

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_output(stdout, job.batch)));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_output(stderr, job.batch)));
        }

        let exit = tokio::select! {
            status = child.wait() => {
                let status = status?;
                AgentExit { code: status.code(), cancelled: false }
            }
            _ = cancel.cancelled() => {
                warn!(task = %job.task_id, batch = job.batch, "cancelling aria2c");
                child.kill().await?;
                AgentExit { code: None, cancelled: true }
            }
        };

        for handle in forwarders {
            let _ = handle.await;
        }
        info!(task = %job.task_id, batch = job.batch, code = ?exit.code, "aria2c exited");
        Ok(exit)
    }
}

/// Logs the parts of aria2c's output worth keeping.
async fn forward_output<R: AsyncRead + Unpin>(reader: R, batch: usize) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("ERROR") || line.contains("Exception") {
            warn!(batch, "aria2c: {line}");
        } else if line.contains("Download complete") || line.starts_with("[DL:") {
            debug!(batch, "aria2c: {line}");
        }
    }
}

impl TransferAgent for Aria2cAgent {
    fn name(&self) -> &str {
        "aria2c"
    }

    fn run<'a>(
        &'a self,
        job: &'a AgentJob,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<AgentExit, ExecutorError>> {
        Box::pin(self.run_job(job, cancel))
    }
}
