//! MLflow tracking server client (REST API 2.0)

use crate::error::{PipelineError, Result};
use crate::tracking::{
    latest_of, ExperimentTracker, ModelRegistry, ModelVersion, RunInfo, RunStatus,
    TrackingConfig,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{debug, error, info};

const API_PREFIX: &str = "/api/2.0/mlflow";
const ARTIFACTS_PREFIX: [&str; 4] = ["api", "2.0", "mlflow-artifacts", "artifacts"];
const PROXIED_ARTIFACT_SCHEME: &str = "mlflow-artifacts:";

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CreateRunResponse {
    run: RunEnvelope,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    info: RunInfo,
}

#[derive(Debug, Deserialize)]
struct GetRunResponse {
    run: RunDetails,
}

#[derive(Debug, Deserialize)]
struct RunDetails {
    info: ArtifactLocation,
}

#[derive(Debug, Deserialize)]
struct ArtifactLocation {
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct ModelVersionResponse {
    model_version: ModelVersion,
}

#[derive(Debug, Deserialize)]
struct SearchVersionsResponse {
    #[serde(default)]
    model_versions: Vec<ModelVersion>,
}

#[derive(Debug, Serialize)]
struct Param<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct Metric<'a> {
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

/// HTTP client for an MLflow tracking server
#[derive(Debug, Clone)]
pub struct MlflowClient {
    client: Client,
    config: TrackingConfig,
}

impl MlflowClient {
    pub fn new(config: TrackingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}{}", self.config.tracking_uri, API_PREFIX, path);
        debug!("Making {} request to {}", method, url);
        self.authorize(self.client.request(method, url))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    /// Upload URL on the server's artifact proxy for a file under `root`
    fn artifact_url(&self, root: &str, artifact_path: &str, file_name: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.tracking_uri).map_err(|e| {
            PipelineError::Config(format!(
                "Invalid tracking URI '{}': {}",
                self.config.tracking_uri, e
            ))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                PipelineError::Config(format!(
                    "Tracking URI '{}' cannot carry a path",
                    self.config.tracking_uri
                ))
            })?
            .pop_if_empty()
            .extend(ARTIFACTS_PREFIX)
            .extend(root.split('/').filter(|s| !s.is_empty()))
            .extend(artifact_path.split('/').filter(|s| !s.is_empty()))
            .push(file_name);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| {
            error!("Tracking request failed: {}", e);
            PipelineError::Tracking(e.to_string())
        })?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;

        if status.is_success() {
            let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
            return serde_json::from_str(body)
                .map_err(|e| PipelineError::Tracking(format!("Malformed response: {}", e)));
        }

        let api_error: Option<ApiError> = serde_json::from_str(&body).ok();
        Err(match api_error {
            Some(e) if !e.error_code.is_empty() => {
                PipelineError::Tracking(format!("{} ({}): {}", e.error_code, status, e.message))
            }
            _ => PipelineError::Tracking(format!("{}: {}", status, body)),
        })
    }

    /// Path of a run's artifact root below the artifact proxy
    async fn artifact_root(&self, run_id: &str) -> Result<String> {
        let response: GetRunResponse = self
            .send(
                self.request(Method::GET, "/runs/get")
                    .query(&[("run_id", run_id)]),
            )
            .await?;
        proxied_artifact_root(&response.run.info.artifact_uri).ok_or_else(|| {
            PipelineError::Tracking(format!(
                "Run {} stores artifacts at '{}', which is not served by the tracking server",
                run_id, response.run.info.artifact_uri
            ))
        })
    }

    /// Create the registered model; an existing one is fine
    async fn ensure_registered_model(&self, name: &str) -> Result<()> {
        let response = self
            .request(Method::POST, "/registered-models/create")
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        match Self::decode::<Value>(response).await {
            Err(PipelineError::Tracking(message))
                if message.starts_with("RESOURCE_ALREADY_EXISTS") =>
            {
                debug!("Registered model '{}' already exists", name);
                Ok(())
            }
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        }
    }
}

/// `mlflow-artifacts:/0/<run>/artifacts` or `mlflow-artifacts://host/0/<run>/artifacts`
/// to `0/<run>/artifacts`
fn proxied_artifact_root(artifact_uri: &str) -> Option<String> {
    let rest = artifact_uri.strip_prefix(PROXIED_ARTIFACT_SCHEME)?;
    let path = match rest.strip_prefix("//") {
        Some(with_authority) => with_authority.find('/').map(|i| &with_authority[i..])?,
        None => rest,
    };
    let path = path.trim_matches('/');
    (!path.is_empty()).then(|| path.to_string())
}

#[async_trait]
impl ExperimentTracker for MlflowClient {
    async fn create_run(&self, experiment_id: &str, run_name: Option<&str>) -> Result<RunInfo> {
        let mut body = json!({
            "experiment_id": experiment_id,
            "start_time": Utc::now().timestamp_millis(),
        });
        if let (Some(name), Some(map)) = (run_name, body.as_object_mut()) {
            map.insert("run_name".to_string(), json!(name));
        }

        let response: CreateRunResponse = self
            .send(self.request(Method::POST, "/runs/create").json(&body))
            .await?;
        Ok(response.run.info)
    }

    async fn log_batch(
        &self,
        run_id: &str,
        params: &[(String, String)],
        metrics: &[(String, f64)],
    ) -> Result<()> {
        let timestamp = Utc::now().timestamp_millis();
        let params: Vec<Param> = params
            .iter()
            .map(|(key, value)| Param { key, value })
            .collect();
        let metrics: Vec<Metric> = metrics
            .iter()
            .map(|(key, value)| Metric {
                key,
                value: *value,
                timestamp,
                step: 0,
            })
            .collect();

        let _: Value = self
            .send(self.request(Method::POST, "/runs/log-batch").json(&json!({
                "run_id": run_id,
                "params": params,
                "metrics": metrics,
            })))
            .await?;
        Ok(())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        local_file: &Path,
    ) -> Result<()> {
        let file_name = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PipelineError::Tracking(format!("{} has no file name", local_file.display()))
            })?;
        let contents = tokio::fs::read(local_file).await?;
        let root = self.artifact_root(run_id).await?;
        let url = self.artifact_url(&root, artifact_path, file_name)?;

        debug!("Making PUT request to {}", url);
        let _: Value = self
            .send(self.authorize(self.client.put(url)).body(contents))
            .await?;
        info!("Uploaded {} to run {} under '{}'", file_name, run_id, artifact_path);
        Ok(())
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let _: Value = self
            .send(self.request(Method::POST, "/runs/update").json(&json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": Utc::now().timestamp_millis(),
            })))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ModelRegistry for MlflowClient {
    async fn latest_version(&self, name: &str) -> Result<ModelVersion> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let response = self
            .request(Method::GET, "/model-versions/search")
            .query(&[("filter", filter.as_str())])
            .send()
            .await
            .map_err(|e| PipelineError::Tracking(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PipelineError::RegistryLookupFailure(name.to_string()));
        }
        let found: SearchVersionsResponse = match Self::decode(response).await {
            Err(PipelineError::Tracking(message))
                if message.starts_with("RESOURCE_DOES_NOT_EXIST") =>
            {
                return Err(PipelineError::RegistryLookupFailure(name.to_string()))
            }
            other => other?,
        };

        latest_of(found.model_versions.into_iter().filter(|v| v.name == name))
            .ok_or_else(|| PipelineError::RegistryLookupFailure(name.to_string()))
    }

    async fn register_version(
        &self,
        name: &str,
        source: &str,
        run_id: Option<&str>,
    ) -> Result<ModelVersion> {
        self.ensure_registered_model(name).await?;

        let mut body = json!({ "name": name, "source": source });
        if let (Some(run_id), Some(map)) = (run_id, body.as_object_mut()) {
            map.insert("run_id".to_string(), json!(run_id));
        }
        let response: ModelVersionResponse = self
            .send(self.request(Method::POST, "/model-versions/create").json(&body))
            .await?;
        Ok(response.model_version)
    }
}
