//! Batch execution and the command surface.
//!
//! [`BatchExecutor`] drives one batch at a time through capacity check,
//! delegation to a [`TransferAgent`], monitoring and verification, then
//! either advances, pauses for the operator, or stops on failure.
//! [`BatchService`] wires analysis, planning and execution together behind
//! the operator commands (`analyze`, `plan`, `execute`, `continue`,
//! `resume`, `status`, hfd import and housekeeping).

mod agent;
mod capacity;
mod executor;
mod hfd;
mod monitor;
mod service;
mod speed;

pub use agent::{AgentExit, AgentFile, AgentJob, Aria2cAgent, Aria2cOptions, TransferAgent};
pub use capacity::{
    CapacityProbe, FixedCapacity, MIN_TARGET_FREE_SPACE, StatvfsProbe, validate_download_dir,
};
pub use executor::{BatchExecutor, ExecutionOutcome, ExecutorConfig, OutcomeStatus};
pub use service::{
    BatchIntegrity, BatchService, BatchState, DeleteReport, ExecuteReport, FailureKind,
    ImportReport, PlanReport, ServiceConfig, ServiceError, TaskStatusReport,
};
pub use speed::SpeedMeter;

use batchpull_transfer::StoreError;

/// Errors produced while executing batches.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error(
        "insufficient space for batch {batch}: needs {required} bytes, {available} available"
    )]
    CapacityInsufficient {
        batch: usize,
        required: u64,
        available: u64,
    },

    #[error("free-space probe failed: {0}")]
    Capacity(String),

    #[error("invalid target directory: {0}")]
    InvalidTarget(String),

    #[error("transfer agent error: {0}")]
    TransferAgent(String),

    #[error("batch {batch} does not exist (plan has {total})")]
    InvalidBatch { batch: usize, total: usize },
}

impl ExecutorError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            Self::Store(e) => e.is_permission_denied(),
            _ => false,
        }
    }
}
