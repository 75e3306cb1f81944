use crate::config::{clamp_processes, MetricsOptions, PipelineConfig, ToolPaths};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "scaffold-markdup",
    about = "Mark optical and PCR duplicates scaffold-wise in parallel and compute insert size metrics",
    version
)]
pub struct Args {
    /// Input BAM file
    #[arg(short = 'i', long = "input-bam", value_name = "BAM")]
    pub input_bam: PathBuf,

    /// Directory receiving the duplicates-marked BAM, its index and all metrics
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Working directory for the scaffold-wise marking. Needs about twice the input
    /// size; removed after the results are synchronised to the output directory
    #[arg(short = 't', long = "temp-dir", alias = "tmp", value_name = "DIR")]
    pub temp_dir: PathBuf,

    /// Number of parallel duplicate-marking workers (clamped to 2..=24). Each worker
    /// processes whole scaffolds, so more than 24 gains little on a human reference
    #[arg(short = 'p', long = "processes", default_value_t = 12)]
    pub processes: usize,

    /// Minutes to wait for insert size metrics before terminating them
    #[arg(long, default_value_t = 180)]
    pub metrics_timeout_minutes: u64,

    /// Seconds between checks on the insert size metrics process
    #[arg(long, default_value_t = 10)]
    pub metrics_poll_seconds: u64,

    /// samtools executable (default: looked up on PATH)
    #[arg(long, value_name = "PATH")]
    pub samtools: Option<PathBuf>,

    /// picard executable (default: looked up on PATH)
    #[arg(long, value_name = "PATH")]
    pub picard: Option<PathBuf>,

    /// rsync executable (default: looked up on PATH)
    #[arg(long, value_name = "PATH")]
    pub rsync: Option<PathBuf>,

    /// Set logging level to WARN
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Args {
    /// Resolves tools and builds the immutable run configuration.
    pub fn into_config(self) -> Result<PipelineConfig> {
        let tools = ToolPaths::resolve(
            self.samtools.as_deref(),
            self.picard.as_deref(),
            self.rsync.as_deref(),
        )?;
        let mut config = PipelineConfig::new(
            strip_quotes(&self.input_bam),
            self.output_dir,
            self.temp_dir,
            clamp_processes(self.processes),
            tools,
        );
        config.metrics = MetricsOptions {
            timeout: Duration::from_secs(self.metrics_timeout_minutes.saturating_mul(60)),
            poll_interval: Duration::from_secs(self.metrics_poll_seconds),
            ..MetricsOptions::default()
        };
        Ok(config)
    }
}

/// Drops quote characters a wrapper script may have left around the path.
pub fn strip_quotes(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(raw.trim_matches('"').trim_matches('\''))
}
