use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::file::FileSeed;
use crate::{DEFAULT_SAFETY_MARGIN, ModelError};

// ---------------------------------------------------------------------------
// SafetyMargin
// ---------------------------------------------------------------------------

/// Fraction of raw capacity a plan may fill, guaranteed to be in `(0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct SafetyMargin(f64);

impl SafetyMargin {
    pub fn new(value: f64) -> Result<Self, ModelError> {
        if value.is_finite() && value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(ModelError::InvalidSafetyMargin(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// `floor(capacity × margin)`.
    pub fn safe_capacity(self, capacity: u64) -> u64 {
        (capacity as f64 * self.0).floor() as u64
    }
}

impl Default for SafetyMargin {
    fn default() -> Self {
        Self(DEFAULT_SAFETY_MARGIN)
    }
}

impl TryFrom<f64> for SafetyMargin {
    type Error = ModelError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SafetyMargin> for f64 {
    fn from(margin: SafetyMargin) -> Self {
        margin.0
    }
}

// ---------------------------------------------------------------------------
// Batch / BatchPlan
// ---------------------------------------------------------------------------

/// A storage-bounded group of files transferred together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// 1-based position in the plan.
    pub index: usize,
    pub files: Vec<FileSeed>,
    pub total_size: u64,
    /// Set only for a batch holding a single file larger than the safe capacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oversize_note: Option<String>,
}

impl Batch {
    pub fn new(index: usize, files: Vec<FileSeed>) -> Self {
        let total_size = files.iter().map(|f| f.size).sum();
        Self {
            index,
            files,
            total_size,
            oversize_note: None,
        }
    }

    pub fn is_oversize(&self) -> bool {
        self.oversize_note.is_some()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStrategy {
    SingleBatch,
    MultiBatch,
}

impl std::fmt::Display for PlanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleBatch => f.write_str("single_batch"),
            Self::MultiBatch => f.write_str("multi_batch"),
        }
    }
}

/// Output of the planner: an ordered partition of an inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub strategy: PlanStrategy,
    pub batches: Vec<Batch>,
    pub capacity: u64,
    pub safety_margin: SafetyMargin,
    pub safe_capacity: u64,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
}

impl BatchPlan {
    pub fn total_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn total_files(&self) -> usize {
        self.batches.iter().map(Batch::file_count).sum()
    }

    /// Returns the batch with the given 1-based index.
    pub fn batch(&self, index: usize) -> Option<&Batch> {
        index
            .checked_sub(1)
            .and_then(|i| self.batches.get(i))
            .filter(|b| b.index == index)
    }

    pub fn max_batch_size(&self) -> u64 {
        self.batches.iter().map(|b| b.total_size).max().unwrap_or(0)
    }

    pub fn oversize_batches(&self) -> impl Iterator<Item = &Batch> {
        self.batches.iter().filter(|b| b.is_oversize())
    }
}

// ---------------------------------------------------------------------------
// BatchProgress
// ---------------------------------------------------------------------------

/// Where a multi-batch task stands; read back by `continue` and `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub task_id: String,
    pub current_batch: usize,
    pub total_batches: usize,
    pub batch_size: u64,
    pub timestamp: DateTime<Utc>,
}

impl BatchProgress {
    pub fn new(task_id: &str, batch: &Batch, total_batches: usize) -> Self {
        Self {
            task_id: task_id.to_string(),
            current_batch: batch.index,
            total_batches,
            batch_size: batch.total_size,
            timestamp: Utc::now(),
        }
    }

    pub fn is_last(&self) -> bool {
        self.current_batch >= self.total_batches
    }
}
