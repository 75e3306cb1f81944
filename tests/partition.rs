use proptest::prelude::*;
use scaffold_markdup::{plan_partitions, PipelineError, Scaffold, ScaffoldCatalog};
use std::collections::HashMap;

fn catalog(lengths: &[u64]) -> ScaffoldCatalog {
    let scaffolds = lengths
        .iter()
        .enumerate()
        .map(|(i, &len)| Scaffold::new(format!("scaffold{i}"), len))
        .collect();
    ScaffoldCatalog::new(scaffolds, "test").unwrap()
}

fn worker_totals(catalog: &ScaffoldCatalog, assignments: &[Vec<String>]) -> Vec<u64> {
    assignments
        .iter()
        .map(|names| names.iter().map(|n| catalog.length_of(n).unwrap()).sum())
        .collect()
}

/// Four scaffolds over two workers split into two perfectly balanced halves.
#[test]
fn four_scaffolds_two_workers_balance_exactly() {
    let catalog = catalog(&[100, 90, 60, 50]);
    let plan = plan_partitions(&catalog, 2).unwrap();

    assert_eq!(plan.scaffolds_for(0), ["scaffold0", "scaffold3"]);
    assert_eq!(plan.scaffolds_for(1), ["scaffold1", "scaffold2"]);
    assert_eq!(worker_totals(&catalog, plan.assignments()), vec![150, 150]);
}

/// Scaffolds are walked longest first regardless of catalog order.
#[test]
fn longest_scaffold_goes_first() {
    let catalog = catalog(&[10, 500, 20]);
    let plan = plan_partitions(&catalog, 3).unwrap();
    // target = 176: 500 overflows worker 0's preference and falls to the least loaded (0).
    assert_eq!(plan.scaffolds_for(0), ["scaffold1"]);
    assert_eq!(plan.scaffolds_for(1), ["scaffold2"]);
    assert_eq!(plan.scaffolds_for(2), ["scaffold0"]);
}

/// Equal lengths keep catalog order, so planning is deterministic.
#[test]
fn ties_keep_catalog_order() {
    let catalog = catalog(&[50, 50, 50, 50]);
    let first = plan_partitions(&catalog, 2).unwrap();
    let second = plan_partitions(&catalog, 2).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.scaffolds_for(0), ["scaffold0", "scaffold2"]);
    assert_eq!(first.scaffolds_for(1), ["scaffold1", "scaffold3"]);
}

#[test]
fn more_workers_than_scaffolds_leaves_empty_lists() {
    let catalog = catalog(&[30, 20, 10]);
    let plan = plan_partitions(&catalog, 5).unwrap();
    assert_eq!(plan.worker_count(), 5);
    let assigned: usize = plan.assignments().iter().map(Vec::len).sum();
    assert_eq!(assigned, 3);
    assert_eq!(plan.assignments().iter().filter(|a| a.is_empty()).count(), 2);
}

#[test]
fn single_worker_takes_everything_in_length_order() {
    let catalog = catalog(&[10, 30, 20]);
    let plan = plan_partitions(&catalog, 1).unwrap();
    assert_eq!(plan.scaffolds_for(0), ["scaffold1", "scaffold2", "scaffold0"]);
}

#[test]
fn zero_workers_is_invalid_configuration() {
    let err = plan_partitions(&catalog(&[10]), 0).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidConfiguration { .. }), "{err}");
}

#[test]
fn empty_catalog_is_unavailable() {
    let err = ScaffoldCatalog::new(Vec::new(), "empty.bam").unwrap_err();
    assert!(matches!(err, PipelineError::CatalogUnavailable { .. }), "{err}");
}

proptest! {
    /// Every scaffold lands on exactly one worker and no worker exceeds the target by
    /// more than the longest scaffold.
    #[test]
    fn plan_covers_catalog_with_bounded_imbalance(
        lengths in prop::collection::vec(0u64..5_000_000, 1..80),
        workers in 1usize..32,
    ) {
        let catalog = catalog(&lengths);
        let plan = plan_partitions(&catalog, workers).unwrap();
        prop_assert_eq!(plan.worker_count(), workers);

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for names in plan.assignments() {
            for name in names {
                *seen.entry(name.as_str()).or_default() += 1;
            }
        }
        prop_assert_eq!(seen.len(), catalog.len());
        prop_assert!(seen.values().all(|&count| count == 1));

        let target = catalog.total_length() / workers as u64;
        let longest = lengths.iter().copied().max().unwrap_or(0);
        for total in worker_totals(&catalog, plan.assignments()) {
            prop_assert!(total <= target + longest, "total {} > {} + {}", total, target, longest);
        }
    }
}
