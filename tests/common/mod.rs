//! Scripted stand-in for samtools, picard and rsync.
//!
//! Every invocation is recorded. Tools "produce" their outputs as small text files so
//! the orchestration around them can be checked on a real filesystem: a scaffold BAM
//! contains its scaffold name, concatenation joins its inputs in argument order.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use scaffold_markdup::error::ExitState;
use scaffold_markdup::tools::{CommandLine, RunningTool, ToolOutput, ToolPipeline, ToolRunner, ToolStep};
use scaffold_markdup::{PipelineConfig, ToolPaths};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the fake insert-size metrics process behaves.
#[derive(Debug, Clone, Copy)]
pub enum MetricsBehavior {
    /// Exits 0 on the given poll (1 = first poll).
    FinishOnPoll(usize),
    /// Never exits on its own.
    Hang,
    /// Exits with this code on the first poll.
    Exit(i32),
}

pub struct FakeRunner {
    pub header: String,
    pub failing_scaffolds: HashSet<String>,
    pub failing_step: Option<ToolStep>,
    pub metrics: MetricsBehavior,
    pub metrics_killed: Arc<AtomicBool>,
    invocations: Mutex<Vec<ToolPipeline>>,
}

impl FakeRunner {
    pub fn new(scaffolds: &[(&str, u64)]) -> Self {
        let mut header = String::from("@HD\tVN:1.6\tSO:coordinate\n");
        for (name, length) in scaffolds {
            header.push_str(&format!("@SQ\tSN:{name}\tLN:{length}\n"));
        }
        header.push_str("@PG\tID:samtools\tPN:samtools\tCL:samtools fixmate -m - -\n");
        Self {
            header,
            failing_scaffolds: HashSet::new(),
            failing_step: None,
            metrics: MetricsBehavior::FinishOnPoll(1),
            metrics_killed: Arc::new(AtomicBool::new(false)),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_scaffold(mut self, scaffold: &str) -> Self {
        self.failing_scaffolds.insert(scaffold.to_string());
        self
    }

    pub fn failing_step(mut self, step: ToolStep) -> Self {
        self.failing_step = Some(step);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsBehavior) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn invocations(&self) -> Vec<ToolPipeline> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocations_of(&self, step: &ToolStep) -> Vec<ToolPipeline> {
        self.invocations().into_iter().filter(|p| &p.step == step).collect()
    }

    fn produce(&self, pipeline: &ToolPipeline) -> Result<String> {
        let last = pipeline.stages.last().ok_or_else(|| anyhow!("empty pipeline"))?;
        match &pipeline.step {
            ToolStep::MateFixing => touch(&value_after(last, "-o")?, "mate-fixed"),
            ToolStep::MateFixedIndexing | ToolStep::Indexing => {
                let args = last.args_lossy();
                touch(Path::new(&args[args.len() - 1]), "index")
            }
            ToolStep::SequenceDictionary => return Ok(self.header.clone()),
            ToolStep::MarkDuplicates(scaffold) => {
                touch(&picard_option(last, "OUTPUT")?, &format!("{scaffold}\n"))?;
                touch(&picard_option(last, "METRICS_FILE")?, &format!("metrics {scaffold}\n"))
            }
            ToolStep::Concatenation => {
                let args = last.args_lossy();
                let output = value_after(last, "-o")?;
                let mut joined = String::new();
                for part in &args[1..args.len() - 2] {
                    joined.push_str(&fs::read_to_string(part)?);
                }
                touch(&output, &joined)
            }
            ToolStep::Relocation => rsync(last),
            ToolStep::InsertSizeMetrics => Ok(()),
        }?;
        Ok(String::new())
    }
}

impl ToolRunner for FakeRunner {
    fn run(&self, pipeline: &ToolPipeline) -> Result<ToolOutput> {
        self.invocations.lock().unwrap().push(pipeline.clone());
        let failing = match &pipeline.step {
            ToolStep::MarkDuplicates(scaffold) => self.failing_scaffolds.contains(scaffold),
            step => self.failing_step.as_ref() == Some(step),
        };
        if failing {
            return Ok(ToolOutput {
                status: ExitState::Code(1),
                stdout: "partial output".to_string(),
                stderr: format!("[fake] {} failed", pipeline.step),
            });
        }
        let stdout = self.produce(pipeline)?;
        Ok(ToolOutput { status: ExitState::Code(0), stdout, stderr: String::new() })
    }

    fn spawn(&self, pipeline: &ToolPipeline) -> Result<Box<dyn RunningTool>> {
        self.invocations.lock().unwrap().push(pipeline.clone());
        let picard = &pipeline.stages[0];
        Ok(Box::new(FakeMetrics {
            behavior: self.metrics,
            polls: AtomicUsize::new(0),
            outputs: vec![picard_option(picard, "O")?, picard_option(picard, "H")?],
            killed: Arc::clone(&self.metrics_killed),
        }))
    }
}

/// Metrics process that finishes after a scripted number of polls.
pub struct FakeMetrics {
    pub behavior: MetricsBehavior,
    pub polls: AtomicUsize,
    pub outputs: Vec<PathBuf>,
    pub killed: Arc<AtomicBool>,
}

impl FakeMetrics {
    pub fn new(behavior: MetricsBehavior) -> Self {
        Self {
            behavior,
            polls: AtomicUsize::new(0),
            outputs: Vec::new(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl RunningTool for FakeMetrics {
    fn try_wait(&mut self) -> Result<Option<ToolOutput>> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let status = match self.behavior {
            MetricsBehavior::FinishOnPoll(n) if poll >= n => ExitState::Code(0),
            MetricsBehavior::Exit(code) => ExitState::Code(code),
            _ => return Ok(None),
        };
        if status.success() {
            for output in &self.outputs {
                touch(output, "insert sizes")?;
            }
        }
        Ok(Some(ToolOutput { status, stdout: String::new(), stderr: String::new() }))
    }

    fn kill(&mut self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Paths of one test run, all under a temporary directory.
pub struct Sandbox {
    pub root: tempfile::TempDir,
    pub input_bam: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = tempfile::TempDir::new().unwrap();
        let input_dir = root.path().join("input");
        fs::create_dir_all(&input_dir).unwrap();
        let input_bam = input_dir.join("sample.bam");
        fs::write(&input_bam, "raw").unwrap();
        Self {
            output_dir: root.path().join("output"),
            temp_dir: root.path().join("work"),
            input_bam,
            root,
        }
    }

    pub fn config(&self, processes: usize) -> PipelineConfig {
        let tools = ToolPaths {
            samtools: PathBuf::from("samtools"),
            picard: PathBuf::from("picard"),
            rsync: PathBuf::from("rsync"),
        };
        let mut config = PipelineConfig::new(
            self.input_bam.clone(),
            self.output_dir.clone(),
            self.temp_dir.clone(),
            processes,
            tools,
        );
        config.metrics.timeout = Duration::from_millis(500);
        config.metrics.poll_interval = Duration::from_millis(5);
        config
    }
}

fn touch(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

fn value_after(command: &CommandLine, flag: &str) -> Result<PathBuf> {
    let args = command.args_lossy();
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1))
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("{flag} missing from {command}"))
}

fn picard_option(command: &CommandLine, key: &str) -> Result<PathBuf> {
    let prefix = format!("{key}=");
    command
        .args_lossy()
        .iter()
        .find_map(|a| a.strip_prefix(&prefix).map(PathBuf::from))
        .ok_or_else(|| anyhow!("{key}= missing from {command}"))
}

/// `rsync [-rl] --checksum <sources...> <dest>/`, copy semantics.
fn rsync(command: &CommandLine) -> Result<()> {
    let args: Vec<String> = command.args_lossy().into_iter().filter(|a| !a.starts_with('-')).collect();
    let (destination, sources) = args.split_last().ok_or_else(|| anyhow!("rsync without arguments"))?;
    let destination = PathBuf::from(destination);
    fs::create_dir_all(&destination)?;
    for source in sources {
        let source = PathBuf::from(source);
        if source.is_dir() {
            copy_dir_contents(&source, &destination)?;
        } else {
            let name = source.file_name().ok_or_else(|| anyhow!("no file name"))?;
            fs::copy(&source, destination.join(name))?;
        }
    }
    Ok(())
}

fn copy_dir_contents(source: &Path, destination: &Path) -> Result<()> {
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            copy_dir_contents(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
