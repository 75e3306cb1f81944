//! Fan-in of worker outcomes and their re-ordering into reference order.

use crate::error::{PipelineError, Result};
use crate::header::ScaffoldCatalog;
use crate::layout::file_component;
use crate::types::{HashSet, HashSetExt, ScaffoldResult, WorkerOutcome};
use std::path::PathBuf;

/// Per-scaffold artifacts of a fully successful run, in reference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    /// Scaffold BAMs in the order they must be concatenated.
    pub ordered_bams: Vec<PathBuf>,
    /// Per-scaffold metrics files, parallel to `ordered_bams`.
    pub ordered_metrics: Vec<PathBuf>,
}

/// Receives exactly once from every worker's channel.
///
/// Blocks on each channel in turn with no timeout; a worker that never reports stalls
/// collection. A channel that closes without a report (the worker died) counts as a
/// failed worker.
pub fn receive_outcomes<I, R>(channels: I) -> Vec<WorkerOutcome>
where
    I: IntoIterator<Item = R>,
    R: FnOnce() -> Option<WorkerOutcome>,
{
    channels
        .into_iter()
        .enumerate()
        .map(|(worker, receive)| {
            receive().unwrap_or_else(|| {
                tracing::error!(worker, "worker channel closed without a report");
                WorkerOutcome::Failed
            })
        })
        .collect()
}

/// Merges all outcomes and orders the per-scaffold results by `catalog`.
///
/// Any failure marker fails the whole run with `PartitioningFailed`; results are
/// never partially used. The output order depends only on the catalog, not on the
/// order the outcomes arrived in.
pub fn collect(catalog: &ScaffoldCatalog, outcomes: Vec<WorkerOutcome>) -> Result<AggregateResult> {
    let workers = outcomes.len();
    let failed = outcomes.iter().filter(|o| o.is_failed()).count();
    if failed > 0 {
        return Err(PipelineError::PartitioningFailed { failed, workers });
    }

    let received: Vec<ScaffoldResult> = outcomes
        .into_iter()
        .flat_map(|outcome| match outcome {
            WorkerOutcome::Completed(results) => results,
            WorkerOutcome::Failed => Vec::new(),
        })
        .collect();

    let mut slots: Vec<Option<ScaffoldResult>> = vec![None; catalog.len()];
    let mut seen = HashSet::with_capacity(received.len());
    for result in received {
        let position = catalog
            .position(&result.scaffold)
            .ok_or_else(|| mismatch(&result.scaffold, "not declared in the sequence dictionary"))?;
        if !embeds_scaffold(&result) {
            return Err(mismatch(
                &result.scaffold,
                format!("output '{}' does not carry the scaffold name", result.bam.display()),
            ));
        }
        if !seen.insert(result.scaffold.clone()) {
            return Err(mismatch(&result.scaffold, "reported more than once"));
        }
        slots[position] = Some(result);
    }

    let mut ordered_bams = Vec::with_capacity(slots.len());
    let mut ordered_metrics = Vec::with_capacity(slots.len());
    for (name, slot) in catalog.names().zip(slots) {
        let result = slot.ok_or_else(|| mismatch(name, "no worker reported this scaffold"))?;
        ordered_bams.push(result.bam);
        ordered_metrics.push(result.metrics);
    }
    Ok(AggregateResult { ordered_bams, ordered_metrics })
}

/// Scaffold BAMs are named `...-{scaffold}.bam`.
fn embeds_scaffold(result: &ScaffoldResult) -> bool {
    let suffix = format!("-{}", file_component(&result.scaffold));
    result
        .bam
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.ends_with(&suffix))
}

fn mismatch(scaffold: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::OrderingMismatch { scaffold: scaffold.to_string(), reason: reason.into() }
}
