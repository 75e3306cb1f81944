use crate::collector;
use crate::config::{MarkDupOptions, ToolPaths};
use crate::layout::RunLayout;
use crate::partition::PartitionPlan;
use crate::tools::{self, MarkDupTarget, ToolRunner};
use crate::types::{ScaffoldResult, WorkerId, WorkerOutcome};
use anyhow::{Context, Result};
use crossfire::mpmc;
use std::fs;
use std::path::Path;
use std::thread;

/// Shared, read-only state every worker needs.
#[derive(Clone, Copy)]
pub struct WorkerContext<'a> {
    pub runner: &'a dyn ToolRunner,
    pub tools: &'a ToolPaths,
    pub options: &'a MarkDupOptions,
    pub layout: &'a RunLayout,
    /// Coordinate-sorted, mate-fixed and indexed input shared by all workers.
    pub input_bam: &'a Path,
}

/// Marks duplicates on `scaffolds` in order, stopping at the first failure.
///
/// Each scaffold gets its own randomly suffixed directory under the working directory.
/// Directories are left in place: the caller removes them after concatenation, and a
/// failed run keeps them for inspection.
pub fn run_worker(ctx: &WorkerContext<'_>, worker: WorkerId, scaffolds: &[String]) -> WorkerOutcome {
    let mut results = Vec::with_capacity(scaffolds.len());
    for scaffold in scaffolds {
        tracing::info!(worker, scaffold = %scaffold, "marking duplicates");
        match mark_scaffold(ctx, scaffold) {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::error!(
                    worker,
                    scaffold = %scaffold,
                    error = %format!("{e:#}"),
                    "duplicate marking failed; abandoning the rest of this worker's scaffolds"
                );
                return WorkerOutcome::Failed;
            }
        }
    }
    tracing::debug!(worker, scaffolds = results.len(), "worker finished");
    WorkerOutcome::Completed(results)
}

fn mark_scaffold(ctx: &WorkerContext<'_>, scaffold: &str) -> Result<ScaffoldResult> {
    let dir = ctx.layout.create_scaffold_dir(scaffold)?;
    let scratch = dir.join("tmp");
    fs::create_dir(&scratch)
        .with_context(|| format!("failed to create scaffold directory {}", scratch.display()))?;
    let bam = ctx.layout.scaffold_bam(&dir, scaffold);
    let metrics = ctx.layout.scaffold_metrics(&dir, scaffold);

    let target = MarkDupTarget {
        scaffold,
        input_bam: ctx.input_bam,
        scratch_dir: &scratch,
        output_bam: &bam,
        metrics_file: &metrics,
    };
    tools::run_checked(ctx.runner, &tools::mark_duplicates(ctx.tools, ctx.options, &target))?;
    Ok(ScaffoldResult { scaffold: scaffold.to_string(), bam, metrics })
}

/// Starts one worker per plan entry and blocks until every worker has reported.
///
/// Each worker owns a single-slot channel that carries exactly one outcome and is
/// closed when the worker returns. Outcomes come back indexed by worker.
pub fn run_workers(ctx: &WorkerContext<'_>, plan: PartitionPlan) -> Vec<WorkerOutcome> {
    crossfire::detect_backoff_cfg();
    let assignments = plan.into_assignments();

    thread::scope(|scope| {
        let mut receivers = Vec::with_capacity(assignments.len());
        let mut handles = Vec::with_capacity(assignments.len());
        for (worker, scaffolds) in assignments.iter().enumerate() {
            let (tx, rx) = mpmc::bounded_blocking::<WorkerOutcome>(1);
            let ctx = *ctx;
            handles.push(scope.spawn(move || {
                let outcome = run_worker(&ctx, worker, scaffolds);
                let _ = tx.send(outcome);
            }));
            receivers.push(rx);
        }

        let outcomes = collector::receive_outcomes(
            receivers.into_iter().map(|rx| move || rx.recv().ok()),
        );

        for (worker, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                tracing::error!(worker, "worker thread panicked");
            }
        }
        outcomes
    })
}
