//! External tool invocation.
//!
//! samtools, picard and rsync are opaque: a [`ToolPipeline`] describes what to run,
//! a [`ToolRunner`] runs it and hands back the exit state plus captured output.

use crate::config::{MarkDupOptions, MetricsOptions, PipelineConfig, ToolPaths};
use crate::error::{ExitState, PipelineError};
use crate::layout::RunLayout;
use anyhow::{anyhow, Context, Result};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

/// Which step of the run an invocation belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStep {
    MateFixing,
    MateFixedIndexing,
    SequenceDictionary,
    MarkDuplicates(String),
    Concatenation,
    Indexing,
    Relocation,
    InsertSizeMetrics,
}

impl fmt::Display for ToolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStep::MateFixing => f.write_str("mate information fixing"),
            ToolStep::MateFixedIndexing => f.write_str("indexing of mate-fixed BAM file"),
            ToolStep::SequenceDictionary => f.write_str("reading the sequence dictionary"),
            ToolStep::MarkDuplicates(scaffold) => {
                write!(f, "duplicate marking for scaffold '{scaffold}'")
            }
            ToolStep::Concatenation => f.write_str("concatenation of scaffold BAM files"),
            ToolStep::Indexing => f.write_str("indexing of duplicates marked concatenated BAM file"),
            ToolStep::Relocation => f.write_str("rsyncing results"),
            ToolStep::InsertSizeMetrics => f.write_str("insert sizes computation"),
        }
    }
}

/// One program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// `KEY=value` style argument as picard expects them.
    pub fn option(self, key: &str, value: impl AsRef<OsStr>) -> Self {
        let mut arg = OsString::from(format!("{key}="));
        arg.push(value.as_ref());
        self.arg(arg)
    }

    /// Arguments as lossy UTF-8, for logging and inspection.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Commands chained stdout→stdin. Succeeds only when every stage exits 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPipeline {
    pub step: ToolStep,
    pub stages: Vec<CommandLine>,
}

impl ToolPipeline {
    pub fn single(step: ToolStep, command: CommandLine) -> Self {
        Self { step, stages: vec![command] }
    }

    pub fn piped(step: ToolStep, stages: Vec<CommandLine>) -> Self {
        Self { step, stages }
    }
}

impl fmt::Display for ToolPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, stage) in self.stages.iter().enumerate() {
            if idx > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

/// Exit state and captured streams of a finished pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: ExitState,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Turns a non-zero exit into [`PipelineError::ExternalToolFailure`].
    pub fn check(self, step: &ToolStep) -> std::result::Result<ToolOutput, PipelineError> {
        if self.success() {
            Ok(self)
        } else {
            Err(PipelineError::ExternalToolFailure {
                step: step.to_string(),
                status: self.status,
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

/// A pipeline started in the background.
pub trait RunningTool: Send {
    /// Returns the output once every stage has exited, without blocking.
    fn try_wait(&mut self) -> Result<Option<ToolOutput>>;
    /// Forcibly terminates every stage still running.
    fn kill(&mut self) -> Result<()>;
}

/// Capability to run external tools; the seam tests replace with fakes.
pub trait ToolRunner: Send + Sync {
    /// Runs `pipeline` to completion.
    fn run(&self, pipeline: &ToolPipeline) -> Result<ToolOutput>;
    /// Starts `pipeline` and returns immediately.
    fn spawn(&self, pipeline: &ToolPipeline) -> Result<Box<dyn RunningTool>>;
}

/// Runs `pipeline` and fails with `ExternalToolFailure` on a non-zero exit.
pub fn run_checked(runner: &dyn ToolRunner, pipeline: &ToolPipeline) -> Result<ToolOutput> {
    tracing::debug!(step = %pipeline.step, command = %pipeline, "running external tool");
    let output = runner
        .run(pipeline)
        .with_context(|| format!("failed to run {}", pipeline.step))?;
    if !output.success() {
        tracing::error!(
            step = %pipeline.step,
            status = %output.status,
            stdout = %output.stdout,
            stderr = %output.stderr,
            "external tool returned with non-zero exit status"
        );
    }
    Ok(output.check(&pipeline.step)?)
}

// ── std::process implementation ──────────────────────────────────────────────

/// Runs pipelines as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, pipeline: &ToolPipeline) -> Result<ToolOutput> {
        let mut spawned = SpawnedPipeline::start(pipeline)?;
        spawned.wait()
    }

    fn spawn(&self, pipeline: &ToolPipeline) -> Result<Box<dyn RunningTool>> {
        Ok(Box::new(SpawnedPipeline::start(pipeline)?))
    }
}

struct SpawnedPipeline {
    children: Vec<Child>,
    statuses: Vec<Option<ExitStatus>>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Vec<JoinHandle<Vec<u8>>>,
}

impl SpawnedPipeline {
    fn start(pipeline: &ToolPipeline) -> Result<Self> {
        if pipeline.stages.is_empty() {
            return Err(anyhow!("{} has no commands", pipeline.step));
        }
        let last = pipeline.stages.len() - 1;
        let mut spawned = SpawnedPipeline {
            children: Vec::with_capacity(pipeline.stages.len()),
            statuses: Vec::with_capacity(pipeline.stages.len()),
            stdout: None,
            stderr: Vec::with_capacity(pipeline.stages.len()),
        };
        let mut upstream = None;

        for (idx, stage) in pipeline.stages.iter().enumerate() {
            let stdin = match upstream.take() {
                Some(out) => Stdio::from(out),
                None => Stdio::null(),
            };
            let child = Command::new(&stage.program)
                .args(&stage.args)
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn();
            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    spawned.abort();
                    return Err(anyhow!("failed to spawn {}: {}", stage.program.display(), e));
                }
            };
            if let Some(err) = child.stderr.take() {
                spawned.stderr.push(drain(err));
            }
            if idx == last {
                spawned.stdout = child.stdout.take().map(drain);
            } else {
                upstream = child.stdout.take();
            }
            spawned.children.push(child);
            spawned.statuses.push(None);
        }
        Ok(spawned)
    }

    fn wait(&mut self) -> Result<ToolOutput> {
        for (child, status) in self.children.iter_mut().zip(self.statuses.iter_mut()) {
            if status.is_none() {
                *status = Some(child.wait()?);
            }
        }
        Ok(self.collect())
    }

    fn collect(&mut self) -> ToolOutput {
        let status = self
            .statuses
            .iter()
            .flatten()
            .map(|s| s.code().map_or(ExitState::Signal, ExitState::Code))
            .find(|s| !s.success())
            .unwrap_or(ExitState::Code(0));
        let stdout = self.stdout.take().map(join_lossy).unwrap_or_default();
        let stderr = self.stderr.drain(..).map(join_lossy).collect::<Vec<_>>().join("");
        ToolOutput { status, stdout, stderr }
    }

    /// Kills already-started stages after a later stage failed to spawn.
    fn abort(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl RunningTool for SpawnedPipeline {
    fn try_wait(&mut self) -> Result<Option<ToolOutput>> {
        for (child, status) in self.children.iter_mut().zip(self.statuses.iter_mut()) {
            if status.is_none() {
                *status = child.try_wait()?;
            }
        }
        if self.statuses.iter().all(Option::is_some) {
            Ok(Some(self.collect()))
        } else {
            Ok(None)
        }
    }

    fn kill(&mut self) -> Result<()> {
        for (child, status) in self.children.iter_mut().zip(self.statuses.iter_mut()) {
            if status.is_none() {
                // fails harmlessly if the stage exited since the last poll
                let _ = child.kill();
                *status = Some(child.wait()?);
            }
        }
        // grandchildren may still hold the pipes open; leave the drain threads detached
        self.stdout = None;
        self.stderr.clear();
        Ok(())
    }
}

fn drain<R: Read + Send + 'static>(mut stream: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        buf
    })
}

fn join_lossy(handle: JoinHandle<Vec<u8>>) -> String {
    handle
        .join()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

// ── command builders ─────────────────────────────────────────────────────────

/// `samtools sort -n | samtools fixmate -m | samtools sort` into the mate-fixed BAM.
pub fn mate_fixing(config: &PipelineConfig, layout: &RunLayout) -> ToolPipeline {
    let samtools = &config.tools.samtools;
    let threads = config.sort_threads().to_string();
    let name_sort = CommandLine::new(samtools)
        .args(["sort", "--threads", threads.as_str(), "-n", "-T"])
        .arg(layout.namesort_dir().join(&layout.stem))
        .arg(&config.input_bam);
    let fixmate = CommandLine::new(samtools).args(["fixmate", "-m", "-", "-"]);
    let coord_sort = CommandLine::new(samtools)
        .args(["sort", "--threads", threads.as_str(), "-l", "1", "-o"])
        .arg(layout.mate_fixed_bam())
        .arg("-T")
        .arg(layout.coordsort_dir().join(&layout.stem))
        .arg("-");
    ToolPipeline::piped(ToolStep::MateFixing, vec![name_sort, fixmate, coord_sort])
}

/// `samtools index <bam> <bam>.bai`
pub fn index(tools: &ToolPaths, step: ToolStep, bam: &Path, bai: &Path) -> ToolPipeline {
    ToolPipeline::single(step, CommandLine::new(&tools.samtools).arg("index").arg(bam).arg(bai))
}

/// `samtools view -H <bam>`
pub fn sequence_dictionary(tools: &ToolPaths, bam: &Path) -> ToolPipeline {
    ToolPipeline::single(
        ToolStep::SequenceDictionary,
        CommandLine::new(&tools.samtools).args(["view", "-H"]).arg(bam),
    )
}

/// samtools region for a whole scaffold; names with `:` need the brace form.
pub fn region(scaffold: &str) -> String {
    if scaffold.contains(':') {
        format!("{{{scaffold}}}")
    } else {
        scaffold.to_string()
    }
}

/// Paths one `MarkDuplicatesWithMateCigar` invocation writes to.
#[derive(Debug, Clone)]
pub struct MarkDupTarget<'a> {
    pub scaffold: &'a str,
    pub input_bam: &'a Path,
    pub scratch_dir: &'a Path,
    pub output_bam: &'a Path,
    pub metrics_file: &'a Path,
}

/// `samtools view` of one scaffold piped into `picard MarkDuplicatesWithMateCigar`.
pub fn mark_duplicates(tools: &ToolPaths, options: &MarkDupOptions, target: &MarkDupTarget<'_>) -> ToolPipeline {
    let select = CommandLine::new(&tools.samtools)
        .args(["view", "-h", "-F"])
        .arg(options.exclude_flags.to_string())
        .arg("--uncompressed")
        .arg(target.input_bam)
        .arg(region(target.scaffold));
    let mark = CommandLine::new(&tools.picard)
        .arg(format!("-Xmx{}", options.java_heap))
        .arg("MarkDuplicatesWithMateCigar")
        .option("INPUT", "/dev/stdin")
        .option("TMP_DIR", target.scratch_dir)
        .option("OUTPUT", target.output_bam)
        .option("METRICS_FILE", target.metrics_file)
        .option("ASSUME_SORTED", "true")
        .option("MINIMUM_DISTANCE", options.minimum_distance.to_string())
        .option("COMPRESSION_LEVEL", options.compression_level.to_string())
        .option("CREATE_INDEX", options.create_index.to_string())
        .option("MAX_RECORDS_IN_RAM", options.max_records_in_ram.to_string())
        .option(
            "OPTICAL_DUPLICATE_PIXEL_DISTANCE",
            options.optical_duplicate_pixel_distance.to_string(),
        )
        .option("REMOVE_DUPLICATES", options.remove_duplicates.to_string());
    ToolPipeline::piped(ToolStep::MarkDuplicates(target.scaffold.to_string()), vec![select, mark])
}

/// `samtools cat <parts...> -o <output>`; `parts` must already be in reference order.
pub fn concatenate(tools: &ToolPaths, parts: &[PathBuf], output: &Path) -> ToolPipeline {
    ToolPipeline::single(
        ToolStep::Concatenation,
        CommandLine::new(&tools.samtools).arg("cat").args(parts).arg("-o").arg(output),
    )
}

/// `rsync --checksum <files...> <dest>/`
pub fn relocate_files(tools: &ToolPaths, files: &[PathBuf], destination: &Path) -> ToolPipeline {
    ToolPipeline::single(
        ToolStep::Relocation,
        CommandLine::new(&tools.rsync).arg("--checksum").args(files).arg(dir_arg(destination)),
    )
}

/// `rsync -rl --checksum <src>/ <dest>/` (directory contents, not the directory itself).
pub fn relocate_dir(tools: &ToolPaths, source: &Path, destination: &Path) -> ToolPipeline {
    ToolPipeline::single(
        ToolStep::Relocation,
        CommandLine::new(&tools.rsync)
            .args(["-rl", "--checksum"])
            .arg(dir_arg(source))
            .arg(dir_arg(destination)),
    )
}

/// `picard CollectInsertSizeMetrics` on the whole input.
pub fn insert_size_metrics(
    tools: &ToolPaths,
    options: &MetricsOptions,
    input_bam: &Path,
    layout: &RunLayout,
) -> ToolPipeline {
    ToolPipeline::single(
        ToolStep::InsertSizeMetrics,
        CommandLine::new(&tools.picard)
            .arg(format!("-Xmx{}", options.java_heap))
            .arg("CollectInsertSizeMetrics")
            .option("I", input_bam)
            .option("O", layout.insert_size_metrics())
            .option("H", layout.insert_size_histogram())
            .option("M", options.minimum_pct.to_string())
            .option("TMP_DIR", layout.insert_size_scratch_dir()),
    )
}

fn dir_arg(dir: &Path) -> OsString {
    let mut arg = dir.as_os_str().to_owned();
    if !arg.to_string_lossy().ends_with('/') {
        arg.push("/");
    }
    arg
}
