//! Insert-size metrics on the whole input, running beside duplicate marking.

use crate::config::{MetricsOptions, PipelineConfig};
use crate::error::{format_hms, PipelineError};
use crate::layout::{recreate_dir, RunLayout};
use crate::tools::{self, RunningTool, ToolOutput, ToolRunner, ToolStep};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// The metrics process while it runs in the background.
pub struct MetricsBranch {
    tool: Box<dyn RunningTool>,
    started: Instant,
}

/// Starts `CollectInsertSizeMetrics` on the unmodified input, writing into the working
/// directory.
pub fn start(runner: &dyn ToolRunner, config: &PipelineConfig, layout: &RunLayout) -> Result<MetricsBranch> {
    if same_dir(config.input_bam.parent(), &layout.temp_dir) {
        return Err(PipelineError::invalid_configuration(
            "temp-dir",
            "metrics output directory must not be the input BAM's parent directory",
        )
        .into());
    }
    fs::create_dir_all(&layout.temp_dir)
        .with_context(|| format!("failed to create {}", layout.temp_dir.display()))?;
    recreate_dir(&layout.insert_size_scratch_dir())?;

    let pipeline = tools::insert_size_metrics(&config.tools, &config.metrics, &config.input_bam, layout);
    tracing::info!(command = %pipeline, "starting insert size metrics");
    let tool = runner
        .spawn(&pipeline)
        .with_context(|| format!("failed to start {}", pipeline.step))?;
    Ok(MetricsBranch { tool, started: Instant::now() })
}

impl MetricsBranch {
    /// Waits under the configured cap, then gathers the outputs into `insert_sizes/`.
    pub fn finish(mut self, options: &MetricsOptions, layout: &RunLayout) -> Result<()> {
        let wait_started = Instant::now();
        let output = wait_with_timeout(self.tool.as_mut(), options.timeout, options.poll_interval)?;
        let waited = wait_started.elapsed();
        if waited >= options.poll_interval {
            tracing::info!(waited = %format_hms(waited), "waited for insert size metrics to finish");
        }
        tracing::debug!(runtime = %format_hms(self.started.elapsed()), "insert size metrics exited");
        if !output.success() {
            tracing::error!(
                stdout = %output.stdout,
                stderr = %output.stderr,
                "insert sizes computation child process returned with non-zero exit"
            );
        }
        output.check(&ToolStep::InsertSizeMetrics)?;
        collect_outputs(layout)
    }

    /// Terminates the metrics process after the duplicate-marking branch failed.
    pub fn cancel(mut self) {
        if let Err(e) = self.tool.kill() {
            tracing::warn!(error = %format!("{e:#}"), "failed to terminate insert size metrics");
        }
    }
}

/// Polls `tool` until it exits, killing it once `timeout` has elapsed.
///
/// Exit is checked before the deadline on every round, so a process that has
/// finished by the time the deadline is reached is not reported as timed out.
pub fn wait_with_timeout(
    tool: &mut dyn RunningTool,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<ToolOutput> {
    let started = Instant::now();
    loop {
        if let Some(output) = tool.try_wait()? {
            return Ok(output);
        }
        let waited = started.elapsed();
        if waited >= timeout {
            tracing::warn!(waited = %format_hms(waited), "insert size metrics exceeded the wait limit; terminating");
            tool.kill().context("failed to terminate insert size metrics")?;
            return Err(PipelineError::MetricsTimeout { waited }.into());
        }
        tracing::debug!(waited = %format_hms(waited), "waiting for insert metrics to finish");
        thread::sleep(poll_interval.min(timeout - waited));
    }
}

/// Moves every `{sample}-insert_size_*` entry into `insert_sizes/` and drops the scratch dir.
pub fn collect_outputs(layout: &RunLayout) -> Result<()> {
    let collect_dir = layout.insert_size_collect_dir();
    fs::create_dir_all(&collect_dir)
        .with_context(|| format!("failed to create {}", collect_dir.display()))?;
    let prefix = layout.insert_size_prefix();
    for entry in fs::read_dir(&layout.temp_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let destination = collect_dir.join(&name);
        fs::rename(entry.path(), &destination)
            .with_context(|| format!("failed to move {} into {}", entry.path().display(), collect_dir.display()))?;
    }
    let scratch = layout.insert_size_scratch_dir();
    if scratch.is_dir() {
        fs::remove_dir_all(&scratch).with_context(|| format!("failed to remove {}", scratch.display()))?;
    }
    Ok(())
}

fn same_dir(a: Option<&Path>, b: &Path) -> bool {
    let Some(a) = a else { return false };
    let a = if a.as_os_str().is_empty() { Path::new(".") } else { a };
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
