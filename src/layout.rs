//! Where every intermediate and final artifact of a run lives.

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const MARKDUP_BAM_SUFFIX: &str = ".markdup.bam";
/// Scaffold directories carry a 7-digit suffix.
const SCAFFOLD_DIR_SUFFIXES: u32 = 10_000_000;
const MAX_SCAFFOLD_DIR_ATTEMPTS: usize = 100;

/// Paths derived from the input file, the output directory and the working directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    /// Input file name without its final extension.
    pub stem: String,
    /// Input file name up to `.markdup.bam`, used to name the insert-size outputs.
    pub sample_id: String,
    pub input_bam: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
}

impl RunLayout {
    pub fn new(input_bam: &Path, output_dir: &Path, temp_dir: &Path) -> Self {
        let name = input_bam
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = input_bam
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sample_id = match name.find(MARKDUP_BAM_SUFFIX) {
            Some(pos) => name[..pos].to_string(),
            None => name.clone(),
        };
        Self {
            stem,
            sample_id,
            input_bam: input_bam.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    // ── mate fixing ──────────────────────────────────────────────────────────

    pub fn mate_fixed_bam(&self) -> PathBuf {
        self.temp_dir.join(format!("{}.mateFixed.sorted.bam", self.stem))
    }

    pub fn mate_fixed_index(&self) -> PathBuf {
        index_path(&self.mate_fixed_bam())
    }

    pub fn namesort_dir(&self) -> PathBuf {
        self.temp_dir.join(format!("namesorting-{}", self.stem))
    }

    pub fn coordsort_dir(&self) -> PathBuf {
        self.temp_dir.join(format!("coordsorting-{}", self.stem))
    }

    // ── final outputs ────────────────────────────────────────────────────────

    pub fn output_bam(&self) -> PathBuf {
        self.output_dir.join(format!("{}.markdup.bam", self.stem))
    }

    pub fn output_index(&self) -> PathBuf {
        index_path(&self.output_bam())
    }

    pub fn output_metrics(&self) -> PathBuf {
        self.output_dir.join(format!("{}.markdup.metrics", self.stem))
    }

    /// Destination of the per-scaffold duplicate metrics.
    pub fn scaffold_metrics_dir(&self) -> PathBuf {
        self.output_dir.join(format!("{}_scaffold_metrics", self.stem))
    }

    /// Per-scaffold duplicate metrics held back until the BAM has been relocated.
    pub fn staged_metrics_dir(&self) -> PathBuf {
        self.temp_dir.join(format!("{}_scaffold_metrics", self.stem))
    }

    /// Concatenated result, written next to the scaffolds before relocation.
    pub fn concatenated_bam(&self) -> PathBuf {
        self.temp_dir.join(format!("{}.markdup.bam", self.stem))
    }

    pub fn concatenated_index(&self) -> PathBuf {
        index_path(&self.concatenated_bam())
    }

    // ── per scaffold ─────────────────────────────────────────────────────────

    /// Creates a new, previously nonexistent working directory for one scaffold.
    pub fn create_scaffold_dir(&self, scaffold: &str) -> Result<PathBuf> {
        let mut rng = rand::rng();
        self.create_scaffold_dir_with(scaffold, || rng.random_range(0..SCAFFOLD_DIR_SUFFIXES))
    }

    /// Draws suffixes from `next_suffix` until `{scaffold}-{suffix:07}` can be created.
    pub fn create_scaffold_dir_with(
        &self,
        scaffold: &str,
        mut next_suffix: impl FnMut() -> u32,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.temp_dir)
            .with_context(|| format!("failed to create {}", self.temp_dir.display()))?;
        for _ in 0..MAX_SCAFFOLD_DIR_ATTEMPTS {
            let suffix = next_suffix() % SCAFFOLD_DIR_SUFFIXES;
            let dir = self.temp_dir.join(format!("{}-{suffix:07}", file_component(scaffold)));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(dir = %dir.display(), "scaffold directory exists; drawing another suffix");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to create scaffold directory {}", dir.display()))
                }
            }
        }
        bail!("no free scaffold directory for '{scaffold}' after {MAX_SCAFFOLD_DIR_ATTEMPTS} attempts")
    }

    pub fn scaffold_bam(&self, scaffold_dir: &Path, scaffold: &str) -> PathBuf {
        scaffold_dir.join(format!("{}.markdup-{}.bam", self.stem, file_component(scaffold)))
    }

    pub fn scaffold_metrics(&self, scaffold_dir: &Path, scaffold: &str) -> PathBuf {
        scaffold_dir.join(format!("{}.markdup-{}.metrics", self.stem, file_component(scaffold)))
    }

    // ── insert-size metrics ──────────────────────────────────────────────────

    pub fn insert_size_metrics(&self) -> PathBuf {
        self.temp_dir.join(format!("{}-insert_size_metrics.txt", self.sample_id))
    }

    pub fn insert_size_histogram(&self) -> PathBuf {
        self.temp_dir.join(format!("{}-insert_size_histogram.pdf", self.sample_id))
    }

    pub fn insert_size_scratch_dir(&self) -> PathBuf {
        self.temp_dir.join(format!("{}-insert_sizes_tmp_dir", self.sample_id))
    }

    /// Name prefix shared by every insert-size artifact that gets collected.
    pub fn insert_size_prefix(&self) -> String {
        format!("{}-insert_size_", self.sample_id)
    }

    pub fn insert_size_collect_dir(&self) -> PathBuf {
        self.temp_dir.join("insert_sizes")
    }
}

/// `{bam}.bai`
pub fn index_path(bam: &Path) -> PathBuf {
    let mut os = bam.as_os_str().to_owned();
    os.push(".bai");
    PathBuf::from(os)
}

/// Empties `dir` by removing and re-creating it.
pub fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        let _ = fs::remove_dir_all(dir);
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

/// Renames `from` to `to`, copying across filesystems when a rename is not possible.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .with_context(|| format!("failed to move {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("failed to remove {}", from.display()))
}

/// Scaffold name as it appears inside file names.
pub fn file_component(scaffold: &str) -> String {
    scaffold.replace('/', "_")
}
