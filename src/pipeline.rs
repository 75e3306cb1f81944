//! End-to-end orchestration of one duplicate-marking run.
//!
//! ```text
//! Init → MateFixing → Partitioning → WorkersRunning → Collecting
//!      → Concatenating → Indexing → Relocating → Done
//!
//! Init → MetricsRunning → MetricsWaiting → MetricsRelocated   (concurrently)
//! ```
//!
//! Any failure moves the owning branch to `Failed` and ends the run; nothing is retried
//! and nothing partial reaches the output directory.

use crate::collector::{self, AggregateResult};
use crate::config::PipelineConfig;
use crate::header::{read_catalog, ScaffoldCatalog};
use crate::layout::{move_file, recreate_dir, RunLayout};
use crate::metrics::{self, MetricsBranch};
use crate::partition::{plan_partitions, PartitionPlan};
use crate::tools::{self, run_checked, ToolRunner, ToolStep};
use crate::worker::{self, WorkerContext};
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// State of the duplicate-marking branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    MateFixing,
    Partitioning,
    WorkersRunning,
    Collecting,
    Concatenating,
    Indexing,
    Relocating,
    Done,
    Failed,
}

/// State of the insert-size metrics branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsStage {
    NotStarted,
    MetricsRunning,
    MetricsWaiting,
    MetricsRelocated,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for MetricsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where the results of a successful run ended up.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output_bam: PathBuf,
    pub output_index: PathBuf,
    pub scaffold_metrics_dir: PathBuf,
    pub scaffolds: usize,
    pub workers: usize,
}

/// One invocation: configuration, layout and the state of both branches.
pub struct PipelineRun<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn ToolRunner,
    layout: RunLayout,
    stage: Stage,
    metrics_stage: MetricsStage,
    failed_at: Option<Stage>,
}

impl<'a> PipelineRun<'a> {
    pub fn new(config: &'a PipelineConfig, runner: &'a dyn ToolRunner) -> Self {
        let layout = RunLayout::new(&config.input_bam, &config.output_dir, &config.temp_dir);
        Self {
            config,
            runner,
            layout,
            stage: Stage::Init,
            metrics_stage: MetricsStage::NotStarted,
            failed_at: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn metrics_stage(&self) -> MetricsStage {
        self.metrics_stage
    }

    /// Stage the duplicate-marking branch was in when it failed.
    ///
    /// `None` with `stage() == Stage::Failed` means the metrics branch failed after
    /// duplicate marking had completed.
    pub fn failed_at(&self) -> Option<Stage> {
        self.failed_at
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Runs both branches to completion.
    pub fn execute(&mut self) -> Result<RunSummary> {
        let result = self.drive();
        if result.is_err() {
            let origin = match self.failed_at {
                Some(_) => "duplicate marking",
                None => "insert size metrics",
            };
            tracing::error!(
                origin,
                stage = %self.stage,
                metrics_stage = %self.metrics_stage,
                failed_at = ?self.failed_at,
                "run failed"
            );
        }
        result
    }

    fn drive(&mut self) -> Result<RunSummary> {
        let metrics = match self.prepare() {
            Ok(metrics) => metrics,
            Err(e) => {
                self.fail();
                return Err(e);
            }
        };
        self.enter_metrics(MetricsStage::MetricsRunning);

        let summary = match self.mark_duplicates() {
            Ok(summary) => summary,
            Err(e) => {
                self.fail();
                metrics.cancel();
                self.metrics_stage = MetricsStage::Failed;
                return Err(e);
            }
        };

        self.enter_metrics(MetricsStage::MetricsWaiting);
        if let Err(e) = metrics.finish(&self.config.metrics, &self.layout) {
            self.metrics_stage = MetricsStage::Failed;
            self.stage = Stage::Failed;
            return Err(e);
        }
        self.enter_metrics(MetricsStage::MetricsRelocated);

        if let Err(e) = self.relocate_working_dir() {
            self.fail();
            return Err(e);
        }
        self.enter(Stage::Done);
        Ok(summary)
    }

    /// Validates the configuration, creates the directories and starts the metrics branch.
    fn prepare(&mut self) -> Result<MetricsBranch> {
        self.config.validate()?;
        fs::create_dir_all(&self.config.output_dir)
            .with_context(|| format!("failed to create {}", self.config.output_dir.display()))?;
        fs::create_dir_all(&self.config.temp_dir)
            .with_context(|| format!("failed to create {}", self.config.temp_dir.display()))?;
        metrics::start(self.runner, self.config, &self.layout)
    }

    fn mark_duplicates(&mut self) -> Result<RunSummary> {
        let fixed_bam = self.fix_mate_information()?;

        self.enter(Stage::Partitioning);
        let catalog = read_catalog(self.runner, &self.config.tools, &fixed_bam)?;
        let plan = plan_partitions(&catalog, self.config.processes)?;
        log_plan(&catalog, &plan);

        self.enter(Stage::WorkersRunning);
        let ctx = WorkerContext {
            runner: self.runner,
            tools: &self.config.tools,
            options: &self.config.markdup,
            layout: &self.layout,
            input_bam: &fixed_bam,
        };
        let outcomes = worker::run_workers(&ctx, plan);

        self.enter(Stage::Collecting);
        let aggregate = collector::collect(&catalog, outcomes)?;
        self.stage_scaffold_metrics(&aggregate)?;

        self.enter(Stage::Concatenating);
        self.concatenate(&aggregate)?;
        self.remove_intermediates(&aggregate, &fixed_bam)?;

        self.enter(Stage::Indexing);
        let concatenated = self.layout.concatenated_bam();
        let concatenated_index = self.layout.concatenated_index();
        run_checked(
            self.runner,
            &tools::index(&self.config.tools, ToolStep::Indexing, &concatenated, &concatenated_index),
        )?;

        self.enter(Stage::Relocating);
        self.relocate_result(&concatenated, &concatenated_index)?;
        self.relocate_scaffold_metrics()?;

        Ok(RunSummary {
            output_bam: self.layout.output_bam(),
            output_index: self.layout.output_index(),
            scaffold_metrics_dir: self.layout.scaffold_metrics_dir(),
            scaffolds: catalog.len(),
            workers: self.config.processes,
        })
    }

    /// Name-sorts, fixes mate tags and coordinate-sorts the input, then indexes it.
    fn fix_mate_information(&mut self) -> Result<PathBuf> {
        self.enter(Stage::MateFixing);
        let namesort_dir = self.layout.namesort_dir();
        let coordsort_dir = self.layout.coordsort_dir();
        recreate_dir(&namesort_dir)?;
        recreate_dir(&coordsort_dir)?;

        let fixed_bam = self.layout.mate_fixed_bam();
        run_checked(self.runner, &tools::mate_fixing(self.config, &self.layout))?;
        run_checked(
            self.runner,
            &tools::index(
                &self.config.tools,
                ToolStep::MateFixedIndexing,
                &fixed_bam,
                &self.layout.mate_fixed_index(),
            ),
        )?;

        let _ = fs::remove_dir_all(&namesort_dir);
        let _ = fs::remove_dir_all(&coordsort_dir);
        Ok(fixed_bam)
    }

    /// Moves the per-scaffold duplicate metrics out of the scaffold directories,
    /// which are deleted after concatenation, into the working directory.
    fn stage_scaffold_metrics(&self, aggregate: &AggregateResult) -> Result<()> {
        let staging = self.layout.staged_metrics_dir();
        recreate_dir(&staging)?;
        for metrics_file in &aggregate.ordered_metrics {
            let Some(name) = metrics_file.file_name() else { continue };
            move_file(metrics_file, &staging.join(name))?;
        }
        Ok(())
    }

    /// Moves the staged per-scaffold duplicate metrics into the output directory.
    ///
    /// Runs only once the concatenated BAM and its index are in place, so a failed
    /// run leaves no metrics at the destination.
    fn relocate_scaffold_metrics(&self) -> Result<()> {
        let staging = self.layout.staged_metrics_dir();
        let metrics_dir = self.layout.scaffold_metrics_dir();
        fs::create_dir_all(&metrics_dir)
            .with_context(|| format!("failed to create {}", metrics_dir.display()))?;
        for entry in fs::read_dir(&staging).with_context(|| format!("failed to read {}", staging.display()))? {
            let metrics_file = entry?.path();
            let Some(name) = metrics_file.file_name() else { continue };
            let destination = metrics_dir.join(name);
            if destination.is_file() {
                tracing::warn!(
                    file = %destination.display(),
                    "mark duplicates metrics file already exists at destination; deleting it"
                );
                fs::remove_file(&destination)?;
            }
            move_file(&metrics_file, &destination)?;
        }
        fs::remove_dir_all(&staging).with_context(|| format!("failed to remove {}", staging.display()))
    }

    /// Concatenates the scaffold BAMs in reference order.
    fn concatenate(&self, aggregate: &AggregateResult) -> Result<()> {
        let concatenated = self.layout.concatenated_bam();
        if concatenated.is_file() {
            tracing::warn!(
                file = %concatenated.display(),
                "output BAM file already exists in temporary directory; deleting it before concatenating"
            );
            fs::remove_file(&concatenated)?;
        }
        run_checked(
            self.runner,
            &tools::concatenate(&self.config.tools, &aggregate.ordered_bams, &concatenated),
        )?;
        Ok(())
    }

    /// Drops scaffold directories and the mate-fixed BAM once they are concatenated.
    fn remove_intermediates(&self, aggregate: &AggregateResult, fixed_bam: &Path) -> Result<()> {
        for bam in &aggregate.ordered_bams {
            if let Some(dir) = bam.parent() {
                let _ = fs::remove_dir_all(dir);
            }
        }
        remove_if_present(&self.layout.mate_fixed_index())?;
        remove_if_present(fixed_bam)
    }

    /// Moves the concatenated BAM and its index into the output directory.
    fn relocate_result(&self, bam: &Path, index: &Path) -> Result<()> {
        let output_bam = self.layout.output_bam();
        if output_bam.is_file() {
            tracing::warn!(file = %output_bam.display(), "output BAM file already exists; deleting it before rsyncing");
            fs::remove_file(&output_bam)?;
        }
        let output_index = self.layout.output_index();
        if output_index.is_file() {
            tracing::warn!(file = %output_index.display(), "output BAM file index already exists; deleting it before rsyncing");
            fs::remove_file(&output_index)?;
        }
        fs::create_dir_all(&self.config.output_dir)?;
        run_checked(
            self.runner,
            &tools::relocate_files(
                &self.config.tools,
                &[bam.to_path_buf(), index.to_path_buf()],
                &self.config.output_dir,
            ),
        )?;
        remove_if_present(index)?;
        remove_if_present(bam)
    }

    /// Synchronises what is left in the working directory and removes it.
    fn relocate_working_dir(&self) -> Result<()> {
        run_checked(
            self.runner,
            &tools::relocate_dir(&self.config.tools, &self.config.temp_dir, &self.config.output_dir),
        )
        .with_context(|| {
            format!(
                "terminating before deleting temporary directory '{}'",
                self.config.temp_dir.display()
            )
        })?;
        let _ = fs::remove_dir_all(&self.config.temp_dir);
        Ok(())
    }

    fn fail(&mut self) {
        self.failed_at = Some(self.stage);
        self.stage = Stage::Failed;
    }

    fn enter(&mut self, stage: Stage) {
        tracing::info!(from = %self.stage, to = %stage, "duplicate marking stage");
        self.stage = stage;
    }

    fn enter_metrics(&mut self, stage: MetricsStage) {
        tracing::info!(from = %self.metrics_stage, to = %stage, "metrics stage");
        self.metrics_stage = stage;
    }
}

/// Runs one complete invocation with `runner` providing the external tools.
pub fn run(config: &PipelineConfig, runner: &dyn ToolRunner) -> Result<RunSummary> {
    PipelineRun::new(config, runner).execute()
}

fn log_plan(catalog: &ScaffoldCatalog, plan: &PartitionPlan) {
    for (worker, scaffolds) in plan.assignments().iter().enumerate() {
        let base_pairs: u64 = scaffolds.iter().filter_map(|s| catalog.length_of(s)).sum();
        tracing::info!(worker, scaffolds = scaffolds.len(), base_pairs, "worker assignment");
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
