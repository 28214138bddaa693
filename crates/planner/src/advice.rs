//! Disk-usage timeline and storage-management hints for a plan.

use batchpull_model::{BatchPlan, PlanStrategy, format_size};
use serde::Serialize;

/// Share of available space above which the largest batch triggers a warning.
const LARGE_BATCH_RATIO: f64 = 0.8;

/// Cumulative bytes written by the end of each batch, assuming nothing is
/// archived in between.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsagePoint {
    pub batch: usize,
    pub batch_size: u64,
    pub cumulative_size: u64,
    pub file_count: usize,
}

pub fn usage_timeline(plan: &BatchPlan) -> Vec<UsagePoint> {
    let mut cumulative = 0;
    plan.batches
        .iter()
        .map(|b| {
            cumulative += b.total_size;
            UsagePoint {
                batch: b.index,
                batch_size: b.total_size,
                cumulative_size: cumulative,
                file_count: b.file_count(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionLevel {
    Info,
    Recommendation,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub level: SuggestionLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagementAdvice {
    pub total_batches: usize,
    pub max_batch_size: u64,
    pub available_space: u64,
    pub suggestions: Vec<Suggestion>,
}

/// Hints for an operator cycling storage between batches.
///
/// Returns `None` for single-batch plans, which need no media swaps.
pub fn suggest_management(plan: &BatchPlan, available_space: u64) -> Option<ManagementAdvice> {
    if plan.strategy == PlanStrategy::SingleBatch {
        return None;
    }
    let max_batch_size = plan.max_batch_size();
    let mut suggestions = Vec::new();

    if max_batch_size as f64 > available_space as f64 * LARGE_BATCH_RATIO {
        suggestions.push(Suggestion {
            level: SuggestionLevel::Warning,
            message: format!(
                "largest batch ({}) uses more than 80% of the available space ({}); free space before starting",
                format_size(max_batch_size),
                format_size(available_space)
            ),
        });
    }

    if plan.total_batches() > 2 {
        suggestions.push(Suggestion {
            level: SuggestionLevel::Recommendation,
            message: "archive completed files to other media every 2-3 batches".into(),
        });
    }

    let oversize = plan.oversize_batches().count();
    if oversize > 0 {
        suggestions.push(Suggestion {
            level: SuggestionLevel::Info,
            message: format!(
                "{oversize} batch(es) hold a single file larger than the safe capacity and need extra headroom"
            ),
        });
    }

    Some(ManagementAdvice {
        total_batches: plan.total_batches(),
        max_batch_size,
        available_space,
        suggestions,
    })
}
