//! Deploying the latest registered model version to an endpoint

use crate::backend::OrchestrationBackend;
use crate::core::{Execution, ExecutionDescription, InputSource, ModelStep, Pipeline};
use crate::error::Result;
use crate::execution::{PipelineSession, WaitOptions};
use crate::tracking::{ModelRegistry, ModelVersion};
use tracing::info;

pub const DEFAULT_DEPLOY_INSTANCE_TYPE: &str = "ml.m5.large";
const DEPLOY_STEP_NAME: &str = "DeployLatestModel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySettings {
    pub endpoint_name: String,
    /// Serving container image
    pub image_uri: String,
    pub instance_type: String,
    pub initial_instance_count: u32,
    /// Defaults to `<endpoint_name>-deploy`
    pub pipeline_name: Option<String>,
}

impl DeploySettings {
    pub fn new(endpoint_name: impl Into<String>, image_uri: impl Into<String>) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            image_uri: image_uri.into(),
            instance_type: DEFAULT_DEPLOY_INSTANCE_TYPE.to_string(),
            initial_instance_count: 1,
            pipeline_name: None,
        }
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    pub fn with_initial_instance_count(mut self, count: u32) -> Self {
        self.initial_instance_count = count;
        self
    }

    pub fn with_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    fn pipeline_name(&self) -> String {
        self.pipeline_name
            .clone()
            .unwrap_or_else(|| format!("{}-deploy", self.endpoint_name))
    }
}

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub version: ModelVersion,
    pub execution: Execution,
    pub description: ExecutionDescription,
}

/// Single-step pipeline deploying `version` to the configured endpoint
pub fn deployment_pipeline(version: &ModelVersion, settings: &DeploySettings) -> Result<Pipeline> {
    let step = ModelStep::deploy(
        DEPLOY_STEP_NAME,
        InputSource::Uri(version.source.clone()),
        settings.image_uri.clone(),
        settings.endpoint_name.clone(),
        settings.instance_type.clone(),
    )
    .initial_instance_count(settings.initial_instance_count)
    .build()?;
    Pipeline::new(settings.pipeline_name(), vec![step])
}

/// Look up the latest version of `model_name` and deploy it.
///
/// Fails with `RegistryLookupFailure` before touching the backend when the
/// model has no registered versions. A deployment that ends in a status
/// other than `Succeeded` is returned as `Ok`, like [`PipelineSession::run`].
pub async fn deploy_latest<R, B>(
    registry: &R,
    session: &PipelineSession<B>,
    model_name: &str,
    settings: &DeploySettings,
    wait: &WaitOptions,
) -> Result<DeployOutcome>
where
    R: ModelRegistry + ?Sized,
    B: OrchestrationBackend,
{
    let version = registry.latest_version(model_name).await?;
    info!(
        "Deploying {} version {} from {} to endpoint '{}'",
        model_name, version.version, version.source, settings.endpoint_name
    );

    let pipeline = deployment_pipeline(&version, settings)?;
    let (execution, description) = session.run(&pipeline, wait).await?;

    Ok(DeployOutcome {
        version,
        execution,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::core::ExecutionStatus;
    use crate::error::PipelineError;
    use crate::tracking::InMemoryTracker;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast() -> WaitOptions {
        WaitOptions::default()
            .with_poll_interval(Duration::from_millis(1))
            .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_deploys_highest_version() {
        let registry = InMemoryTracker::new();
        registry.insert_version("iris", 1, "runs:/old/model").await;
        registry.insert_version("iris", 3, "runs:/new/model").await;
        let backend = Arc::new(InMemoryBackend::new());
        let session = PipelineSession::new(backend.clone(), "arn:role");

        let outcome = deploy_latest(
            &registry,
            &session,
            "iris",
            &DeploySettings::new("iris-endpoint", "serving:latest"),
            &fast(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.version.version, "3");
        assert_eq!(outcome.description.status, ExecutionStatus::Succeeded);
        let step = outcome.description.step(DEPLOY_STEP_NAME).unwrap();
        assert_eq!(step.outputs["EndpointName"], "iris-endpoint");

        let definition = backend.definition("iris-endpoint-deploy").await.unwrap();
        assert_eq!(
            definition.steps()[0]["Arguments"]["PrimaryContainer"]["ModelDataUrl"],
            "runs:/new/model"
        );
    }

    #[tokio::test]
    async fn test_unknown_model_fails_before_submission() {
        let backend = Arc::new(InMemoryBackend::new());
        let session = PipelineSession::new(backend.clone(), "arn:role");

        let err = deploy_latest(
            &InMemoryTracker::new(),
            &session,
            "missing",
            &DeploySettings::new("e", "serving:latest"),
            &fast(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::RegistryLookupFailure(_)));
        assert_eq!(backend.pipeline_count().await, 0);
    }
}
