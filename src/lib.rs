//! ml-pipeline - define, submit and monitor ML training pipelines
//!
//! Pipelines are typed step graphs (processing, training, model registration
//! or deployment) handed to an orchestration backend. The crate also carries
//! the jobs those steps run and a client for the deployed model.

pub mod backend;
pub mod cli;
pub mod core;
pub mod deploy;
pub mod error;
pub mod execution;
pub mod inference;
pub mod jobs;
pub mod model;
pub mod persistence;
pub mod tracking;

// Re-export commonly used types
pub use backend::{HttpBackend, InMemoryBackend, OrchestrationBackend};
pub use core::{
    Execution, ExecutionDescription, ExecutionStatus, Pipeline, PipelineConfig, Settings, Step,
};
pub use error::{PipelineError, Result};
pub use execution::{ExecutionEvent, PipelineSession, RetryPolicy, WaitOptions};
pub use model::DecisionTreeClassifier;
