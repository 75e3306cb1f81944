use std::path::PathBuf;

// Fast hash maps / sets using AHash instead of the default SipHash.
// Import these throughout the codebase with `use crate::types::{HashMap, HashSet}`.
// Also import `HashMapExt` / `HashSetExt` when you need `::new()` or `::with_capacity()`.
pub(crate) type HashMap<K, V> = ahash::HashMap<K, V>;
pub(crate) type HashSet<K> = ahash::HashSet<K>;
pub(crate) use ahash::HashMapExt;
pub(crate) use ahash::HashSetExt;

/// Index of a worker in `0..N`.
pub type WorkerId = usize;

/// A named reference sequence and its declared length in base pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scaffold {
    pub name: String,
    pub length: u64,
}

impl Scaffold {
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self { name: name.into(), length }
    }
}

/// Artifacts produced by marking duplicates on a single scaffold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldResult {
    pub scaffold: String,
    pub bam: PathBuf,
    pub metrics: PathBuf,
}

/// What a worker reports back once its scaffold list is exhausted or a scaffold failed.
///
/// A failed worker carries no per-scaffold data: scaffolds that completed before the
/// failure are discarded along with the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed(Vec<ScaffoldResult>),
    Failed,
}

impl WorkerOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, WorkerOutcome::Failed)
    }
}
