//! Sequence-dictionary (`@SQ`) parsing into the scaffold catalog.

use crate::config::ToolPaths;
use crate::error::{PipelineError, Result};
use crate::tools::{self, ToolRunner};
use crate::types::{HashMap, HashMapExt, Scaffold};
use noodles::sam;
use std::path::Path;

/// Scaffolds in the order declared by a header, with name lookup.
#[derive(Debug, Clone)]
pub struct ScaffoldCatalog {
    scaffolds: Vec<Scaffold>,
    positions: HashMap<String, usize>,
}

impl ScaffoldCatalog {
    /// Builds a catalog from scaffolds already in reference order.
    ///
    /// `source_name` only labels the error when `scaffolds` is empty or names repeat.
    pub fn new(scaffolds: Vec<Scaffold>, source_name: &str) -> Result<Self> {
        if scaffolds.is_empty() {
            return Err(unavailable(source_name, "header declares no reference sequences"));
        }
        let mut positions = HashMap::with_capacity(scaffolds.len());
        for (idx, scaffold) in scaffolds.iter().enumerate() {
            if positions.insert(scaffold.name.clone(), idx).is_some() {
                return Err(unavailable(
                    source_name,
                    format!("reference sequence '{}' declared twice", scaffold.name),
                ));
            }
        }
        Ok(Self { scaffolds, positions })
    }

    pub fn from_sam_header(header: &sam::Header, source_name: &str) -> Result<Self> {
        let scaffolds = header
            .reference_sequences()
            .iter()
            .map(|(name, map)| Scaffold::new(name.to_string(), map.length().get() as u64))
            .collect();
        Self::new(scaffolds, source_name)
    }

    /// Parses the `@SQ` records of a SAM text header (e.g. `samtools view -H` output).
    ///
    /// Other record types are ignored so that unusual `@PG`/`@CO` content cannot break
    /// the catalog.
    pub fn from_header_text(text: &str, source_name: &str) -> Result<Self> {
        let mut sq_lines = String::new();
        for line in text.lines().filter(|line| line.starts_with("@SQ")) {
            sq_lines.push_str(line);
            sq_lines.push('\n');
        }
        let header: sam::Header = sq_lines
            .parse()
            .map_err(|e| unavailable(source_name, format!("invalid sequence dictionary: {e}")))?;
        Self::from_sam_header(&header, source_name)
    }

    pub fn scaffolds(&self) -> &[Scaffold] {
        &self.scaffolds
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scaffolds.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.scaffolds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scaffolds.is_empty()
    }

    /// Position of `name` in reference order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn length_of(&self, name: &str) -> Option<u64> {
        self.position(name).map(|idx| self.scaffolds[idx].length)
    }

    pub fn total_length(&self) -> u64 {
        self.scaffolds.iter().map(|s| s.length).sum()
    }
}

/// Queries the sequence dictionary of `bam` with `samtools view -H`.
pub fn read_catalog(runner: &dyn ToolRunner, paths: &ToolPaths, bam: &Path) -> Result<ScaffoldCatalog> {
    let source_name = bam.display().to_string();
    let pipeline = tools::sequence_dictionary(paths, bam);
    let output = runner
        .run(&pipeline)
        .map_err(|e| unavailable(&source_name, format!("{e:#}")))?;
    if !output.success() {
        return Err(unavailable(
            &source_name,
            format!("could not determine reference sequence order ({}): {}", output.status, output.stderr.trim()),
        ));
    }
    ScaffoldCatalog::from_header_text(&output.stdout, &source_name)
}

fn unavailable(source_name: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::CatalogUnavailable { source_name: source_name.to_string(), reason: reason.into() }
}
