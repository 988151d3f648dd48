//! Client for a deployed inference endpoint

use crate::error::{PipelineError, Result};
use reqwest::{header, Client, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Deserialized endpoint response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction(pub Value);

impl Prediction {
    /// Predicted labels when the endpoint answers with a list of scalars
    pub fn labels(&self) -> Option<Vec<String>> {
        self.0.as_array()?.iter().map(scalar_label).collect()
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl std::fmt::Display for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn scalar_label(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct InferenceClient {
    client: Client,
    base_url: Url,
    endpoint_name: String,
    token: Option<String>,
}

impl InferenceClient {
    pub fn new(base_url: impl Into<String>, endpoint_name: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let endpoint_name = endpoint_name.into();
        if endpoint_name.trim().is_empty() {
            return Err(PipelineError::Config("Endpoint name is empty".to_string()));
        }
        let base_url = Url::parse(&base_url).map_err(|e| {
            PipelineError::Config(format!("Invalid inference base URL '{}': {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(PipelineError::Config(format!(
                "Inference base URL '{}' cannot have a path",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            endpoint_name,
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// `<base>/endpoints/<name>/invocations` with the name as one encoded segment
    fn invocation_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                PipelineError::Config(format!(
                    "Inference base URL '{}' cannot have a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(["endpoints", self.endpoint_name.as_str(), "invocations"]);
        Ok(url)
    }

    /// Send one feature vector as a single-row batch
    pub async fn predict(&self, features: &[f64]) -> Result<Prediction> {
        if features.is_empty() {
            return Err(PipelineError::InvalidData(
                "At least one feature is required".to_string(),
            ));
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidData(
                "Features must be finite numbers".to_string(),
            ));
        }

        let url = self.invocation_url()?;
        debug!("Invoking endpoint {} with {:?}", url, features);

        let mut request = self
            .client
            .post(url.clone())
            .header(header::ACCEPT, "application/json")
            .json(&[features]);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Inference(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Inference(e.to_string()))?;
        debug!("Prediction response ({}): {}", status, body);

        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::Inference(format!(
                "Endpoint '{}' not found",
                self.endpoint_name
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::Inference(format!("{}: {}", status, body)));
        }

        serde_json::from_str(&body)
            .map(Prediction)
            .map_err(|e| PipelineError::Inference(format!("Malformed response: {}", e)))
    }
}

/// Parse a comma-separated feature list such as `4.0,8.0,6.0,3.0`
pub fn parse_features(text: &str) -> Result<Vec<f64>> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| PipelineError::InvalidData(format!("'{}' is not a number", t)))
        })
        .collect()
}
