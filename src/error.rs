//! Error types shared across the crate

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while defining, submitting or running pipelines
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A job's input directory holds no regular files
    #[error("No input files found in {}", .0.display())]
    NoInputFiles(PathBuf),

    /// A symbolic reference names an output the source step does not declare
    #[error("Output '{output}' is not declared by step '{source_step}' (declares {declared:?})")]
    OutputNameMismatch {
        source_step: String,
        output: String,
        declared: Vec<String>,
    },

    /// The orchestration backend could not be reached or answered with a server error
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The step graph is malformed (cycles, dangling references, bad fields)
    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    /// The named model has no registered version
    #[error("No registered version found for model '{0}'")]
    RegistryLookupFailure(String),

    #[error("Timed out after {elapsed:?} waiting for execution {execution_id}")]
    Timeout {
        execution_id: String,
        elapsed: Duration,
    },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tracking server error: {0}")]
    Tracking(String),

    #[error("Inference endpoint error: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::BackendUnavailable(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        PipelineError::InvalidDefinition(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
