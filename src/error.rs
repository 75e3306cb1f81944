//! Failure taxonomy for a duplicate-marking run.
//!
//! Every variant maps to its own process exit status so that scripted callers can
//! tell the causes apart without parsing log output.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for the coordination core.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// How an external process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Exited normally with this code.
    Code(i32),
    /// Terminated by a signal (or otherwise without an exit code).
    Signal,
}

impl ExitState {
    pub fn success(self) -> bool {
        matches!(self, ExitState::Code(0))
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Code(code) => write!(f, "exit status {code}"),
            ExitState::Signal => f.write_str("terminated by signal"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The sequence dictionary could not be read or declared no sequences.
    #[error("Scaffold catalog unavailable for '{source_name}': {reason}")]
    CatalogUnavailable { source_name: String, reason: String },

    /// A configuration value is out of range or inconsistent.
    #[error("Invalid configuration '{parameter}': {reason}")]
    InvalidConfiguration { parameter: String, reason: String },

    /// An external tool returned a non-zero status.
    #[error("{step} failed ({status})\nThis was the output: {stdout}\nThis was the error output: {stderr}")]
    ExternalToolFailure { step: String, status: ExitState, stdout: String, stderr: String },

    /// At least one worker reported a failure marker.
    #[error("At least one (actually {failed}) of {workers} scaffold duplicate-marking workers failed")]
    PartitioningFailed { failed: usize, workers: usize },

    /// A worker result could not be matched back to the reference order.
    #[error("Scaffold result '{scaffold}' could not be matched to the reference order: {reason}")]
    OrderingMismatch { scaffold: String, reason: String },

    /// The insert-size metrics process exceeded its wall-clock cap and was terminated.
    #[error("waited now {} (hh:mm:ss) for insert size metrics to finish; terminated it", hms(.waited))]
    MetricsTimeout { waited: Duration },
}

impl PipelineError {
    pub fn invalid_configuration(parameter: &str, reason: impl Into<String>) -> Self {
        PipelineError::InvalidConfiguration { parameter: parameter.to_string(), reason: reason.into() }
    }

    /// Process exit status reported for this failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::InvalidConfiguration { .. } => 2,
            PipelineError::ExternalToolFailure { .. } => 3,
            PipelineError::CatalogUnavailable { .. } => 4,
            PipelineError::PartitioningFailed { .. } => 5,
            PipelineError::OrderingMismatch { .. } => 6,
            PipelineError::MetricsTimeout { .. } => 7,
        }
    }
}

/// Exit status for failures outside the taxonomy (filesystem errors and the like).
pub const GENERIC_FAILURE_EXIT_CODE: u8 = 1;

/// Exit status for an arbitrary error chain, looking through any attached context.
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<PipelineError>()
        .map_or(GENERIC_FAILURE_EXIT_CODE, PipelineError::exit_code)
}

fn hms(duration: &Duration) -> String {
    format_hms(*duration)
}

/// Formats a duration as `hh:mm:ss`.
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, rem) = (secs / 3600, secs % 3600);
    format!("{hours:02}:{:02}:{:02}", rem / 60, rem % 60)
}
