//! Resolved runtime settings
//!
//! Every deployment-specific value (execution role, region, service URLs) is
//! supplied explicitly: by a CLI flag, by its environment variable, or by the
//! pipeline YAML, in that order of precedence. Nothing here has a built-in
//! fallback value.

use crate::backend::BackendClientConfig;
use crate::core::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::tracking::TrackingConfig;

#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Execution role for pipeline steps
    pub role_arn: Option<String>,

    pub region: Option<String>,

    /// Orchestration backend connection
    pub backend: Option<BackendClientConfig>,

    /// Experiment tracker / model registry connection
    pub tracking: Option<TrackingConfig>,

    /// Base URL of the inference service hosting endpoints
    pub inference_base_url: Option<String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role_arn(mut self, role_arn: Option<String>) -> Self {
        self.role_arn = non_empty(role_arn);
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = non_empty(region);
        self
    }

    pub fn with_backend(mut self, backend: Option<BackendClientConfig>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_tracking(mut self, tracking: Option<TrackingConfig>) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_inference_base_url(mut self, url: Option<String>) -> Self {
        self.inference_base_url = non_empty(url);
        self
    }

    /// Fill values still unset from the pipeline YAML (lowest precedence)
    pub fn with_pipeline_defaults(mut self, config: &PipelineConfig) -> Self {
        if self.role_arn.is_none() {
            self.role_arn = non_empty(config.role_arn.clone());
        }
        if self.region.is_none() {
            self.region = non_empty(config.region.clone());
        }
        self
    }

    pub fn require_role(&self) -> Result<&str> {
        self.role_arn.as_deref().ok_or_else(|| {
            PipelineError::Config(
                "No execution role configured; pass --role-arn, set PIPELINE_ROLE_ARN or add role_arn to the pipeline file"
                    .to_string(),
            )
        })
    }

    pub fn require_region(&self) -> Result<&str> {
        self.region.as_deref().ok_or_else(|| {
            PipelineError::Config(
                "No region configured; pass --region, set AWS_REGION or add region to the pipeline file"
                    .to_string(),
            )
        })
    }

    pub fn require_backend(&self) -> Result<&BackendClientConfig> {
        self.backend.as_ref().ok_or_else(|| {
            PipelineError::Config(
                "No orchestration backend configured; pass --backend-url, set PIPELINE_BACKEND_URL or use --dry-run"
                    .to_string(),
            )
        })
    }

    pub fn require_inference_base_url(&self) -> Result<&str> {
        self.inference_base_url.as_deref().ok_or_else(|| {
            PipelineError::Config(
                "No inference service configured; pass --base-url or set INFERENCE_BASE_URL"
                    .to_string(),
            )
        })
    }

    /// Tracking is optional; callers skip it when unset
    pub fn tracking(&self) -> Option<&TrackingConfig> {
        self.tracking.as_ref()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
