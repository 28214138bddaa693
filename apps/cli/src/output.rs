//! Human-readable and JSON rendering of command results.

use batchpull_executor::{
    BatchIntegrity, DeleteReport, ExecuteReport, ExecutionOutcome, ImportReport, OutcomeStatus,
    PlanReport, TaskStatusReport,
};
use batchpull_inventory::InventoryAnalysis;
use batchpull_model::{FileStatus, Task, format_size};
use batchpull_planner::SuggestionLevel;
use batchpull_transfer::{IntegrityEntry, IntegrityState, TaskStats};
use serde::Serialize;

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn analysis(analysis: &InventoryAnalysis, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(analysis);
    }
    println!("Collection: {}", analysis.collection);
    println!("Mode:       {}", analysis.mode);
    let approx = if analysis.is_estimated { "~" } else { "" };
    println!("Files:      {approx}{}", analysis.total_files);
    println!("Total size: {approx}{}", format_size(analysis.total_size));
    if let Some(reported) = analysis.reported_total {
        println!("Reported:   {reported} files");
    }
    println!("Elapsed:    {:.1}s", analysis.elapsed.as_secs_f64());

    if !analysis.file_types.is_empty() {
        println!("\nBy extension:");
        for (ext, stats) in &analysis.file_types {
            println!("  {ext:<12} {:>8} files  {:>12}", stats.count, format_size(stats.size));
        }
    }
    if !analysis.largest_files.is_empty() {
        println!("\nLargest files:");
        for file in &analysis.largest_files {
            println!("  {:>12}  {}", format_size(file.size), file.identity);
        }
    }
    if let Some(note) = &analysis.note {
        println!("\nNote: {note}");
    }
    Ok(())
}

pub fn plan(report: &PlanReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    let plan = &report.plan;
    println!("Collection:    {}", report.analysis.collection);
    println!("Strategy:      {}", plan.strategy);
    println!(
        "Capacity:      {} (safe {} at margin {})",
        format_size(plan.capacity),
        format_size(plan.safe_capacity),
        plan.safety_margin.value()
    );
    println!(
        "Total:         {} files, {}",
        plan.total_files(),
        format_size(plan.total_size)
    );
    println!("Batches:       {}", plan.total_batches());
    for point in &report.timeline {
        println!(
            "  batch {:>3}: {:>8} files  {:>12}  (cumulative {})",
            point.batch,
            point.file_count,
            format_size(point.batch_size),
            format_size(point.cumulative_size)
        );
    }
    for batch in &plan.batches {
        if let Some(note) = &batch.oversize_note {
            println!("  batch {}: {note}", batch.index);
        }
    }
    if let Some(advice) = &report.advice {
        println!();
        for suggestion in &advice.suggestions {
            let tag = match suggestion.level {
                SuggestionLevel::Info => "info",
                SuggestionLevel::Recommendation => "tip",
                SuggestionLevel::Warning => "warning",
            };
            println!("[{tag}] {}", suggestion.message);
        }
    }
    println!("\nPlan saved to {}", report.saved_to.display());
    Ok(())
}

pub fn execution(report: &ExecuteReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    println!("Task {}: {}", report.task_id, report.status);
    match &report.outcome {
        ExecutionOutcome::Completed {
            batches_run,
            files_completed,
        } => println!(
            "All {} batch(es) done; {batches_run} run now, {files_completed} file(s) completed",
            report.total_batches
        ),
        ExecutionOutcome::AwaitingOperator {
            completed_batch,
            total_batches,
            ..
        } => println!("Batch {completed_batch}/{total_batches} finished"),
        ExecutionOutcome::BatchFailed {
            batch,
            completed,
            failed,
            exit_code,
        } => {
            let code = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
            println!(
                "Batch {batch} failed: {completed} completed, {failed} failed (agent exit {code})"
            );
        }
        ExecutionOutcome::Cancelled { batch } => println!("Cancelled during batch {batch}"),
    }
    if let Some(next) = &report.next_step {
        println!("Next: {next}");
    }
    Ok(())
}

pub fn status(report: &TaskStatusReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    let task = &report.task;
    task_summary(task);
    if let Some(error) = &task.error_message {
        println!("Error:      {error}");
    }
    for batch in &report.batches {
        match &batch.summary {
            Some(summary) => println!(
                "  batch {:>3}: {}/{} completed, {} moved, {} failed  ({})",
                batch.index,
                summary.completed,
                summary.total_files,
                summary.moved,
                summary.failed,
                summary.completion_rate
            ),
            None => println!(
                "  batch {:>3}: not started ({} files, {})",
                batch.index,
                batch.files,
                format_size(batch.size)
            ),
        }
        for failed in &batch.failed_files {
            println!(
                "      {} ({})",
                failed.identity,
                failed.error_message.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if let Some(next) = &report.next_step {
        println!("Next: {next}");
    }
    Ok(())
}

fn task_summary(task: &Task) {
    println!("Task:       {}", task.id);
    println!("Collection: {}", task.collection);
    println!("Target:     {}", task.target_dir.display());
    println!("Status:     {}", task.status);
    println!(
        "Progress:   {:.1}% ({} of {})",
        task.progress,
        format_size(task.downloaded_size),
        format_size(task.download_size)
    );
    if let Some(batch) = &task.batch {
        println!("Batch:      {}/{}", batch.current_batch, batch.total_batches);
    }
}

pub fn task_line(task: &Task, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(task);
    }
    println!("{}  {:<10} {}", task.id, task.status.to_string(), task.collection);
    Ok(())
}

pub fn task_list(tasks: &[Task], stats: &TaskStats, json: bool) -> anyhow::Result<()> {
    if json {
        #[derive(Serialize)]
        struct TaskListing<'a> {
            tasks: &'a [Task],
            stats: &'a TaskStats,
        }
        return print_json(&TaskListing { tasks, stats });
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in tasks {
        let batch = task
            .batch
            .as_ref()
            .map(|b| format!("{}/{}", b.current_batch, b.total_batches))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<10} {:>6.1}%  batch {:<7} {}",
            task.id,
            task.status.to_string(),
            task.progress,
            batch,
            task.collection
        );
    }
    let counts: Vec<String> = stats
        .by_status
        .iter()
        .map(|(status, n)| format!("{status} {n}"))
        .collect();
    println!("\n{} task(s): {}", stats.total, counts.join(", "));
    Ok(())
}

/// A finished file that is gone from disk was archived by the operator.
fn is_defect(entry: &IntegrityEntry) -> bool {
    match entry.state {
        IntegrityState::Valid => false,
        IntegrityState::SizeMismatch => true,
        IntegrityState::Missing => entry.status == FileStatus::Failed,
    }
}

/// Prints the verification result. Size mismatches and failed files that
/// never landed make it a failure.
pub fn verification(batches: &[BatchIntegrity], json: bool) -> anyhow::Result<OutcomeStatus> {
    let bad = batches
        .iter()
        .flat_map(|b| &b.entries)
        .filter(|e| is_defect(e))
        .count();
    let valid: usize = batches.iter().map(|b| b.count(IntegrityState::Valid)).sum();
    let status = match (bad, valid) {
        (0, _) => OutcomeStatus::Success,
        (_, 0) => OutcomeStatus::Failed,
        _ => OutcomeStatus::Partial,
    };

    if json {
        print_json(batches)?;
        return Ok(status);
    }
    if batches.is_empty() {
        println!("No batch has been started yet.");
        return Ok(status);
    }
    for batch in batches {
        println!(
            "batch {:>3}: {} valid, {} size mismatch, {} missing",
            batch.index,
            batch.count(IntegrityState::Valid),
            batch.count(IntegrityState::SizeMismatch),
            batch.count(IntegrityState::Missing)
        );
        for entry in batch
            .entries
            .iter()
            .filter(|e| is_defect(e))
        {
            match entry.actual_size {
                Some(found) => println!(
                    "    {}: expected {} bytes, found {found}",
                    entry.identity, entry.expected_size
                ),
                None => println!("    {}: failed and absent", entry.identity),
            }
        }
    }
    Ok(status)
}

pub fn cleaned(removed: &[String], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(removed);
    }
    if removed.is_empty() {
        println!("Nothing to clean.");
    } else {
        println!("Removed {} task(s):", removed.len());
        for id in removed {
            println!("  {id}");
        }
    }
    Ok(())
}

pub fn deleted(report: &DeleteReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    println!("Deleted task {}.", report.task_id);
    if report.kept_files {
        println!("Files kept in {}", report.target_dir.display());
    } else {
        println!(
            "Removed {} file(s), {} freed, from {}",
            report.removed_files,
            format_size(report.freed_bytes),
            report.target_dir.display()
        );
    }
    Ok(())
}

pub fn imported(report: &ImportReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    println!("Collection: {}", report.collection);
    println!("Source:     {}", report.source.display());
    println!("Target:     {}", report.target_dir.display());
    println!(
        "Files:      {} of {} complete ({} of {} known)",
        report.completed_files,
        report.total_files,
        format_size(report.completed_size),
        format_size(report.known_size)
    );
    println!("Batches:    {}", report.total_batches);
    if !report.sample_pending.is_empty() {
        println!("Pending, e.g.:");
        for identity in &report.sample_pending {
            println!("  {identity}");
        }
    }
    match &report.task_id {
        Some(id) => println!("\nImported as {id}. Run `batchpull resume {id}` to finish."),
        None => println!("\nDry run; no task created."),
    }
    Ok(())
}
