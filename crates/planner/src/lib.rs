//! Storage-bounded batch planning.
//!
//! [`plan`] partitions an inventory into batches that each fit within
//! `floor(capacity × margin)` bytes, using first-fit-decreasing over a
//! stable size-descending order so identical inputs always produce
//! identical plans.

mod advice;

pub use advice::{
    ManagementAdvice, Suggestion, SuggestionLevel, UsagePoint, suggest_management, usage_timeline,
};

use batchpull_model::{Batch, BatchPlan, FileSeed, PlanStrategy, SafetyMargin, format_size};
use chrono::Utc;
use tracing::{debug, info};

/// Partitions `inventory` into storage-bounded batches.
///
/// - Everything fits in the safe capacity: one batch, `single_batch`.
/// - Otherwise `multi_batch`: files are visited largest first; a file larger
///   than the safe capacity closes the open batch and gets a batch of its
///   own; a file that fits is appended to the open batch; anything else
///   closes the open batch and starts the next one.
///
/// An empty inventory yields zero batches.
pub fn plan(inventory: &[FileSeed], capacity: u64, margin: SafetyMargin) -> BatchPlan {
    let safe_capacity = margin.safe_capacity(capacity);
    let total_size: u64 = inventory.iter().map(|f| f.size).sum();

    let (strategy, batches) = if total_size <= safe_capacity {
        let batches = if inventory.is_empty() {
            Vec::new()
        } else {
            vec![Batch::new(1, inventory.to_vec())]
        };
        (PlanStrategy::SingleBatch, batches)
    } else {
        (PlanStrategy::MultiBatch, first_fit_decreasing(inventory, safe_capacity))
    };

    info!(
        files = inventory.len(),
        total = %format_size(total_size),
        safe_capacity = %format_size(safe_capacity),
        batches = batches.len(),
        %strategy,
        "planned batches"
    );

    BatchPlan {
        strategy,
        batches,
        capacity,
        safety_margin: margin,
        safe_capacity,
        total_size,
        created_at: Utc::now(),
    }
}

fn first_fit_decreasing(inventory: &[FileSeed], safe_capacity: u64) -> Vec<Batch> {
    let mut sorted = inventory.to_vec();
    // `sort_by` is stable: equal sizes keep inventory order.
    sorted.sort_by(|a, b| b.size.cmp(&a.size));

    let mut batches: Vec<Batch> = Vec::new();
    let mut open: Vec<FileSeed> = Vec::new();
    let mut open_size = 0u64;

    for file in sorted {
        if file.size > safe_capacity {
            if !open.is_empty() {
                push_batch(&mut batches, std::mem::take(&mut open));
                open_size = 0;
            }
            let note = format!(
                "single file of {} exceeds the safe capacity of {}",
                format_size(file.size),
                format_size(safe_capacity)
            );
            debug!(file = %file.identity, size = file.size, "oversize file gets its own batch");
            let mut batch = Batch::new(batches.len() + 1, vec![file]);
            batch.oversize_note = Some(note);
            batches.push(batch);
        } else if open_size + file.size <= safe_capacity {
            open_size += file.size;
            open.push(file);
        } else {
            push_batch(&mut batches, std::mem::take(&mut open));
            open_size = file.size;
            open.push(file);
        }
    }
    if !open.is_empty() {
        push_batch(&mut batches, open);
    }
    batches
}

fn push_batch(batches: &mut Vec<Batch>, files: Vec<FileSeed>) {
    let index = batches.len() + 1;
    batches.push(Batch::new(index, files));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn seeds(sizes: &[u64]) -> Vec<FileSeed> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &s)| FileSeed::new(format!("f{i:03}"), format!("http://h/f{i:03}"), s).unwrap())
            .collect()
    }

    fn margin() -> SafetyMargin {
        SafetyMargin::new(0.9).unwrap()
    }

    fn identities(plan: &BatchPlan) -> Vec<Vec<String>> {
        plan.batches
            .iter()
            .map(|b| b.files.iter().map(|f| f.identity.clone()).collect())
            .collect()
    }

    #[test]
    fn single_batch_when_everything_fits() {
        let inv = seeds(&[400, 300, 200]);
        let p = plan(&inv, 1000, margin());
        assert_eq!(p.strategy, PlanStrategy::SingleBatch);
        assert_eq!(p.safe_capacity, 900);
        assert_eq!(p.total_batches(), 1);
        assert_eq!(p.batches[0].files, inv);
        assert_eq!(p.batches[0].total_size, 900);
    }

    #[test]
    fn exceeding_safe_capacity_splits() {
        // 1000 bytes of data against capacity 1000 at 0.9: safe = 900.
        let p = plan(&seeds(&[500, 500]), 1000, margin());
        assert_eq!(p.strategy, PlanStrategy::MultiBatch);
        assert_eq!(p.total_batches(), 2);

        // Same data against capacity 2000: safe = 1800.
        let p = plan(&seeds(&[500, 500]), 2000, margin());
        assert_eq!(p.strategy, PlanStrategy::SingleBatch);
        assert_eq!(p.total_batches(), 1);
    }

    #[test]
    fn empty_inventory_has_no_batches() {
        let p = plan(&[], 1000, margin());
        assert_eq!(p.strategy, PlanStrategy::SingleBatch);
        assert!(p.batches.is_empty());
        assert_eq!(p.total_size, 0);
    }

    #[test]
    fn oversize_file_gets_own_batch() {
        let p = plan(&seeds(&[5000, 100, 100]), 1112, margin());
        assert_eq!(p.safe_capacity, 1000);
        assert_eq!(p.total_batches(), 2);
        assert_eq!(p.batches[0].files.len(), 1);
        assert_eq!(p.batches[0].total_size, 5000);
        assert!(p.batches[0].is_oversize());
        assert_eq!(p.batches[1].total_size, 200);
        assert!(!p.batches[1].is_oversize());
        assert_eq!(p.oversize_batches().count(), 1);
    }

    #[test]
    fn oversize_in_the_middle_closes_open_batch() {
        // Sorted: 2000 (oversize), 600, 600, 500 with safe capacity 1000.
        let p = plan(&seeds(&[600, 2000, 500, 600]), 1000, SafetyMargin::new(1.0).unwrap());
        let sizes: Vec<u64> = p.batches.iter().map(|b| b.total_size).collect();
        assert_eq!(sizes, vec![2000, 600, 600, 500]);
        assert_eq!(p.batches.iter().map(|b| b.index).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn file_equal_to_safe_capacity_is_not_oversize() {
        let p = plan(&seeds(&[900, 900]), 1000, margin());
        assert_eq!(p.total_batches(), 2);
        assert!(p.batches.iter().all(|b| !b.is_oversize()));
    }

    #[test]
    fn partition_is_exact_and_bounded() {
        let sizes: Vec<u64> = (0..200u64).map(|i| (i * 7919) % 450 + 1).collect();
        let inv = seeds(&sizes);
        let p = plan(&inv, 1000, margin());

        for batch in &p.batches {
            if !batch.is_oversize() {
                assert!(batch.total_size <= p.safe_capacity);
            }
            assert_eq!(batch.total_size, batch.files.iter().map(|f| f.size).sum::<u64>());
        }
        let planned: Vec<&str> = p
            .batches
            .iter()
            .flat_map(|b| b.files.iter().map(|f| f.identity.as_str()))
            .collect();
        let unique: BTreeSet<&str> = planned.iter().copied().collect();
        assert_eq!(planned.len(), inv.len());
        assert_eq!(unique.len(), inv.len());
        assert_eq!(p.total_size, sizes.iter().sum::<u64>());
    }

    #[test]
    fn planning_is_deterministic() {
        let inv = seeds(&[300, 300, 300, 250, 250, 100, 100, 100, 50]);
        let a = plan(&inv, 700, margin());
        let b = plan(&inv, 700, margin());
        assert_eq!(identities(&a), identities(&b));
    }

    #[test]
    fn ties_keep_inventory_order() {
        let p = plan(&seeds(&[300, 300, 300]), 700, SafetyMargin::new(1.0).unwrap());
        assert_eq!(
            identities(&p),
            vec![vec!["f000".to_string(), "f001".to_string()], vec!["f002".to_string()]]
        );
    }
}
