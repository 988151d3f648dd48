//! JSON/REST orchestration backend client

use crate::backend::{BackendClientConfig, OrchestrationBackend, UpsertOutcome};
use crate::core::{Execution, ExecutionDescription, PipelineDefinition};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, info};

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct UpsertRequest<'a> {
    /// Definition as a JSON document string
    pipeline_definition: String,
    role_arn: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StartResponse {
    pipeline_execution_arn: String,
    #[serde(default)]
    creation_time: Option<DateTime<Utc>>,
}

/// Backend reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: BackendClientConfig,
}

impl HttpBackend {
    pub fn new(config: BackendClientConfig) -> Result<Self> {
        Url::parse(&config.base_url).map_err(|e| {
            PipelineError::Config(format!("Invalid backend URL '{}': {}", config.base_url, e))
        })?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Join path segments onto the base URL, percent-encoding each segment
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.config.base_url).map_err(|e| {
            PipelineError::Config(format!("Invalid backend URL '{}': {}", self.config.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                PipelineError::Config(format!(
                    "Backend URL '{}' cannot have a path",
                    self.config.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        debug!("Making {} request to {}", method, url);
        let request = self.client.request(method, url);
        match &self.config.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| {
            error!("Request failed: {}", e);
            if e.is_timeout() {
                PipelineError::BackendUnavailable(format!("request timed out: {}", e))
            } else {
                PipelineError::BackendUnavailable(e.to_string())
            }
        })
    }

    /// Decode a success body, or classify the failure.
    ///
    /// 5xx and 429 are transient; other client errors go through `on_client_error`.
    async fn handle_response<T, F>(&self, response: Response, on_client_error: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce(StatusCode, String) -> PipelineError,
    {
        let status = response.status();

        if status.is_success() {
            info!("Request successful: {}", status);
            return response.json().await.map_err(|e| {
                error!("Failed to deserialize response: {}", e);
                PipelineError::BackendUnavailable(format!("Malformed backend response: {}", e))
            });
        }

        let body = response.text().await.unwrap_or_default();
        error!("Request failed with status {}: {}", status, body);

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::BackendUnavailable(format!("{}: {}", status, body)));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PipelineError::Config(format!(
                "Backend rejected credentials ({}): {}",
                status, body
            )));
        }
        Err(on_client_error(status, body))
    }
}

#[async_trait]
impl OrchestrationBackend for HttpBackend {
    async fn upsert_pipeline(
        &self,
        name: &str,
        definition: &PipelineDefinition,
        role_arn: &str,
    ) -> Result<UpsertOutcome> {
        let body = UpsertRequest {
            pipeline_definition: definition.canonical(),
            role_arn,
        };
        let request = self
            .request(Method::PUT, self.url(&["pipelines", name])?)
            .json(&body);
        let response = self.send(request).await?;

        self.handle_response(response, |status, body| {
            PipelineError::InvalidDefinition(format!(
                "Backend refused pipeline '{}' ({}): {}",
                name, status, body
            ))
        })
        .await
    }

    async fn start_execution(&self, pipeline_name: &str) -> Result<Execution> {
        let request = self
            .request(Method::POST, self.url(&["pipelines", pipeline_name, "executions"])?)
            .json(&serde_json::json!({}));
        let response = self.send(request).await?;

        let started: StartResponse = self
            .handle_response(response, |status, body| {
                if status == StatusCode::NOT_FOUND {
                    PipelineError::InvalidDefinition(format!(
                        "Pipeline '{}' has not been upserted",
                        pipeline_name
                    ))
                } else {
                    PipelineError::InvalidDefinition(format!(
                        "Backend refused to start '{}' ({}): {}",
                        pipeline_name, status, body
                    ))
                }
            })
            .await?;

        Ok(Execution {
            execution_id: started.pipeline_execution_arn,
            pipeline_name: pipeline_name.to_string(),
            started_at: started.creation_time.unwrap_or_else(Utc::now),
        })
    }

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription> {
        let request = self.request(Method::GET, self.url(&["executions", execution_id])?);
        let response = self.send(request).await?;

        self.handle_response(response, |status, body| {
            if status == StatusCode::NOT_FOUND {
                PipelineError::ExecutionNotFound(execution_id.to_string())
            } else {
                PipelineError::BackendUnavailable(format!("{}: {}", status, body))
            }
        })
        .await
    }
}
