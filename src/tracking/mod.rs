//! Experiment tracking and model registry
//!
//! The training job records runs and registers model versions; deployment
//! looks up the latest registered version.

pub mod memory;
pub mod mlflow;

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use memory::InMemoryTracker;
pub use mlflow::MlflowClient;

/// Experiment used when none is configured
pub const DEFAULT_EXPERIMENT_ID: &str = "0";

/// Tracking server connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingConfig {
    pub tracking_uri: String,
    pub token: Option<String>,
    pub experiment_id: String,
    pub timeout: Duration,
}

impl TrackingConfig {
    /// Only HTTP(S) tracking servers are reachable; managed-server ARNs are not
    pub fn new(tracking_uri: impl Into<String>) -> Result<Self> {
        let tracking_uri = tracking_uri.into();
        if tracking_uri.starts_with("arn:") {
            return Err(PipelineError::Config(format!(
                "Tracking URI '{}' is an ARN; use the tracking server's HTTP URL",
                tracking_uri
            )));
        }
        if !(tracking_uri.starts_with("http://") || tracking_uri.starts_with("https://")) {
            return Err(PipelineError::Config(format!(
                "Tracking URI '{}' must be an http:// or https:// URL",
                tracking_uri
            )));
        }
        Ok(Self {
            tracking_uri: tracking_uri.trim_end_matches('/').to_string(),
            token: None,
            experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_experiment_id(mut self, experiment_id: Option<String>) -> Self {
        if let Some(id) = experiment_id.filter(|id| !id.is_empty()) {
            self.experiment_id = id;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A tracked run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
}

/// Final state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// One registered version of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    /// Versions are numbered from 1 and sent as strings
    pub version: String,
    /// Where the model artifact lives, e.g. `runs:/<run_id>/model`
    pub source: String,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl ModelVersion {
    pub fn number(&self) -> Option<u64> {
        self.version.parse().ok()
    }
}

/// Highest numbered version; versions that don't parse as numbers are ignored
pub fn latest_of(versions: impl IntoIterator<Item = ModelVersion>) -> Option<ModelVersion> {
    versions
        .into_iter()
        .filter_map(|v| v.number().map(|n| (n, v)))
        .max_by_key(|(n, _)| *n)
        .map(|(_, v)| v)
}

/// Artifact directory the trained model is uploaded to
pub const MODEL_ARTIFACT_PATH: &str = "model";

/// Model URI for the artifact logged under a run
pub fn run_model_uri(run_id: &str) -> String {
    format!("runs:/{}/{}", run_id, MODEL_ARTIFACT_PATH)
}

#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    async fn create_run(&self, experiment_id: &str, run_name: Option<&str>) -> Result<RunInfo>;

    async fn log_batch(
        &self,
        run_id: &str,
        params: &[(String, String)],
        metrics: &[(String, f64)],
    ) -> Result<()>;

    /// Upload `local_file` into `artifact_path` under the run's artifact root,
    /// keeping its file name
    async fn log_artifact(&self, run_id: &str, artifact_path: &str, local_file: &Path)
        -> Result<()>;

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<()>;
}

#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Latest version of a registered model, `RegistryLookupFailure` if none
    async fn latest_version(&self, name: &str) -> Result<ModelVersion>;

    /// Register a new version, creating the registered model if needed
    async fn register_version(
        &self,
        name: &str,
        source: &str,
        run_id: Option<&str>,
    ) -> Result<ModelVersion>;
}
