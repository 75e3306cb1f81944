//! scaffold-markdup: scaffold-parallel duplicate marking with concurrent insert-size metrics.
//!
//! The input BAM is mate-fixed once, its scaffolds are spread over a fixed pool of
//! workers balanced by base pairs, each scaffold is marked by picard in isolation, and
//! the per-scaffold BAMs are concatenated back in reference order. Insert-size metrics
//! on the whole input run alongside and are joined under a wall-clock cap.
//!
//! # Library usage
//!
//! ```no_run
//! use scaffold_markdup::{PipelineConfig, SystemRunner, ToolPaths};
//!
//! # fn main() -> anyhow::Result<()> {
//! let tools = ToolPaths::resolve(None, None, None)?;
//! let config = PipelineConfig::new(
//!     "sample.bam".into(),
//!     "results".into(),
//!     "/scratch/sample".into(),
//!     12,
//!     tools,
//! );
//! let summary = scaffold_markdup::run(&config, &SystemRunner)?;
//! println!("{}", summary.output_bam.display());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod header;
pub mod layout;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod tools;
pub mod types;
pub mod worker;

// Flat re-exports for the most commonly used public types.
pub use collector::{collect, AggregateResult};
pub use config::{MarkDupOptions, MetricsOptions, PipelineConfig, ToolPaths};
pub use error::PipelineError;
pub use header::ScaffoldCatalog;
pub use partition::{plan_partitions, PartitionPlan};
pub use pipeline::{run, MetricsStage, PipelineRun, RunSummary, Stage};
pub use tools::{SystemRunner, ToolRunner};
pub use types::{Scaffold, ScaffoldResult, WorkerOutcome};
