//! Immutable run configuration.
//!
//! External tool locations are resolved once at start-up and passed explicitly to
//! every component, so nothing downstream consults `PATH` on its own.

use crate::error::{PipelineError, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest worker count accepted on the command line.
pub const MIN_PROCESSES: usize = 2;
/// Largest worker count accepted on the command line.
pub const MAX_PROCESSES: usize = 24;

/// Locations of the external executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub samtools: PathBuf,
    pub picard: PathBuf,
    pub rsync: PathBuf,
}

impl ToolPaths {
    /// Resolves each tool from its explicit override or, failing that, from `PATH`.
    pub fn resolve(
        samtools: Option<&Path>,
        picard: Option<&Path>,
        rsync: Option<&Path>,
    ) -> Result<Self> {
        Ok(Self {
            samtools: resolve_tool("samtools", samtools)?,
            picard: resolve_tool("picard", picard)?,
            rsync: resolve_tool("rsync", rsync)?,
        })
    }
}

fn resolve_tool(name: &str, explicit: Option<&Path>) -> Result<PathBuf> {
    let found = match explicit {
        Some(path) => path.is_file().then(|| path.to_path_buf()),
        None => find_on_path(name),
    };
    found.ok_or_else(|| {
        PipelineError::invalid_configuration(
            name,
            format!("the '{name}' executable was not found or is not accessible"),
        )
    })
}

/// First regular file called `name` in the directories of `PATH`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Options for `MarkDuplicatesWithMateCigar`, one invocation per scaffold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkDupOptions {
    /// JVM heap limit, e.g. `2g`. Every worker runs one JVM at a time.
    pub java_heap: String,
    /// Maximum offset between optical duplicate clusters (patterned flowcells).
    pub optical_duplicate_pixel_distance: u32,
    /// Window, in bases, searched around each alignment for duplicates.
    pub minimum_distance: u32,
    pub max_records_in_ram: u64,
    pub compression_level: u8,
    pub create_index: bool,
    /// Duplicates are only flagged when this is false.
    pub remove_duplicates: bool,
    /// SAM flags excluded before marking; 12 drops pairs with either mate unmapped.
    pub exclude_flags: u16,
}

impl Default for MarkDupOptions {
    fn default() -> Self {
        Self {
            java_heap: "2g".to_string(),
            optical_duplicate_pixel_distance: 2500,
            minimum_distance: 750,
            max_records_in_ram: 1_000_000,
            compression_level: 2,
            create_index: true,
            remove_duplicates: false,
            exclude_flags: 12,
        }
    }
}

/// Options for `CollectInsertSizeMetrics` on the whole input.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsOptions {
    pub java_heap: String,
    /// Categories below this fraction of reads are discarded.
    pub minimum_pct: f64,
    /// Hard wall-clock cap on the metrics process.
    pub timeout: Duration,
    /// Sleep between liveness checks while waiting.
    pub poll_interval: Duration,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            java_heap: "15g".to_string(),
            minimum_pct: 0.05,
            timeout: Duration::from_secs(180 * 60),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Everything a run needs, fixed before the first external tool starts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_bam: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub processes: usize,
    pub tools: ToolPaths,
    pub markdup: MarkDupOptions,
    pub metrics: MetricsOptions,
}

impl PipelineConfig {
    pub fn new(
        input_bam: PathBuf,
        output_dir: PathBuf,
        temp_dir: PathBuf,
        processes: usize,
        tools: ToolPaths,
    ) -> Self {
        Self {
            input_bam,
            output_dir,
            temp_dir,
            processes,
            tools,
            markdup: MarkDupOptions::default(),
            metrics: MetricsOptions::default(),
        }
    }

    /// Threads given to each `samtools sort` of the mate-fixing pipeline.
    ///
    /// Two sorts run at once, so each gets half the workers minus the one thread
    /// samtools keeps for itself.
    pub fn sort_threads(&self) -> usize {
        let half = self.processes / 2;
        let half = if half < 1 { 2 } else { half };
        half - 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.processes == 0 {
            return Err(PipelineError::invalid_configuration("processes", "worker count must be >= 1"));
        }
        if self.input_bam.file_stem().is_none() {
            return Err(PipelineError::invalid_configuration(
                "input-bam",
                format!("'{}' has no file name", self.input_bam.display()),
            ));
        }
        if self.metrics.timeout.is_zero() {
            return Err(PipelineError::invalid_configuration(
                "metrics-timeout-minutes",
                "timeout must be positive",
            ));
        }
        if self.metrics.poll_interval.is_zero() {
            return Err(PipelineError::invalid_configuration(
                "metrics-poll-seconds",
                "poll interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Clamps a requested worker count into `MIN_PROCESSES..=MAX_PROCESSES`.
pub fn clamp_processes(requested: usize) -> usize {
    if requested > MAX_PROCESSES {
        tracing::warn!(
            requested,
            limit = MAX_PROCESSES,
            "more parallel processes were requested than allowed; limiting"
        );
        MAX_PROCESSES
    } else if requested < MIN_PROCESSES {
        tracing::warn!(
            requested,
            minimum = MIN_PROCESSES,
            "fewer parallel processes were requested than the minimum; raising"
        );
        MIN_PROCESSES
    } else {
        requested
    }
}
