//! Greedy distribution of scaffolds across workers, balanced by base pairs.

use crate::error::{PipelineError, Result};
use crate::header::ScaffoldCatalog;
use crate::types::WorkerId;

/// Scaffold names assigned to each worker, in assignment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    assignments: Vec<Vec<String>>,
}

impl PartitionPlan {
    pub fn worker_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn scaffolds_for(&self, worker: WorkerId) -> &[String] {
        &self.assignments[worker]
    }

    pub fn assignments(&self) -> &[Vec<String>] {
        &self.assignments
    }

    /// Hands each worker's list over to the worker spawn.
    pub fn into_assignments(self) -> Vec<Vec<String>> {
        self.assignments
    }
}

/// Splits `catalog` across `workers` workers.
///
/// Scaffolds are walked longest first (ties keep catalog order). The i-th scaffold
/// goes to worker `i % workers` while that keeps the worker strictly below
/// `total / workers` base pairs; otherwise it goes to the worker with the smallest
/// running total (lowest index on ties). Workers beyond the scaffold count get
/// empty lists.
pub fn plan_partitions(catalog: &ScaffoldCatalog, workers: usize) -> Result<PartitionPlan> {
    if workers == 0 {
        return Err(PipelineError::invalid_configuration("processes", "worker count must be >= 1"));
    }
    if catalog.is_empty() {
        return Err(PipelineError::CatalogUnavailable {
            source_name: "partition planner".to_string(),
            reason: "no scaffolds to distribute".to_string(),
        });
    }

    let target = catalog.total_length() / workers as u64;

    let mut by_length: Vec<_> = catalog.scaffolds().iter().collect();
    // stable sort keeps catalog order among equal lengths
    by_length.sort_by(|a, b| b.length.cmp(&a.length));

    let mut assignments: Vec<Vec<String>> = vec![Vec::new(); workers];
    let mut totals: Vec<u64> = vec![0; workers];

    for (idx, scaffold) in by_length.into_iter().enumerate() {
        let preferred = idx % workers;
        let worker = if totals[preferred] + scaffold.length < target {
            preferred
        } else {
            least_loaded(&totals)
        };
        assignments[worker].push(scaffold.name.clone());
        totals[worker] += scaffold.length;
    }

    tracing::debug!(workers, target, ?totals, "planned scaffold partitions");
    Ok(PartitionPlan { assignments })
}

fn least_loaded(totals: &[u64]) -> WorkerId {
    let mut best = 0;
    for (worker, &total) in totals.iter().enumerate().skip(1) {
        if total < totals[best] {
            best = worker;
        }
    }
    best
}
