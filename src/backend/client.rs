//! Orchestration backend connection settings

use std::time::Duration;

/// Configuration for the HTTP backend client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendClientConfig {
    /// Base URL of the orchestration service
    pub base_url: String,

    /// Bearer token sent with every request, when set
    pub token: Option<String>,

    /// Timeout for a single request
    pub timeout: Duration,
}

impl BackendClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
