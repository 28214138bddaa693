//! Shared records for batch planning and resumable transfer state.
//!
//! Every other crate in the workspace speaks in these types: inventory
//! entries (`FileSeed`), tracked files (`FileRecord`), the planner's output
//! (`Batch`, `BatchPlan`) and task bookkeeping (`Task`, `BatchProgress`).

mod batch;
mod file;
mod size;
mod task;
mod validation;

pub use batch::{Batch, BatchPlan, BatchProgress, PlanStrategy, SafetyMargin};
pub use file::{FileRecord, FileSeed, FileStatus};
pub use size::format_size;
pub use task::{CollectionKind, CollectionRef, Task, TaskStatus};
pub use validation::validate_identity;

/// Default fraction of raw capacity the planner may fill.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.9;

/// Errors produced when constructing model records.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid file identity: {0}")]
    InvalidIdentity(String),

    #[error("safety margin must be in (0, 1], got {0}")]
    InvalidSafetyMargin(f64),

    #[error("invalid collection reference: {0}")]
    InvalidCollection(String),
}
