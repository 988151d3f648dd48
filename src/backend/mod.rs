//! Orchestration backend seam
//!
//! The backend stores pipeline definitions by name and runs their step
//! graphs. Everything DAG-related past submission (scheduling, retries of
//! individual jobs, resolving step references) happens on its side.

pub mod client;
pub mod http;
pub mod memory;

use crate::core::{Execution, ExecutionDescription, PipelineDefinition};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use client::BackendClientConfig;
pub use http::HttpBackend;
pub use memory::InMemoryBackend;

/// Result of a create-or-update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpsertOutcome {
    pub pipeline_arn: String,

    /// False when a definition already existed under the name
    pub created: bool,

    /// Definition version; unchanged when an identical definition is upserted
    pub version: u64,
}

/// Trait for orchestration backends - allows for different implementations
#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    /// Create the named pipeline or replace its definition
    async fn upsert_pipeline(
        &self,
        name: &str,
        definition: &PipelineDefinition,
        role_arn: &str,
    ) -> Result<UpsertOutcome>;

    /// Start an execution of the current definition; returns without waiting
    async fn start_execution(&self, pipeline_name: &str) -> Result<Execution>;

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription>;
}

#[async_trait]
impl<T: OrchestrationBackend + ?Sized> OrchestrationBackend for Arc<T> {
    async fn upsert_pipeline(
        &self,
        name: &str,
        definition: &PipelineDefinition,
        role_arn: &str,
    ) -> Result<UpsertOutcome> {
        (**self).upsert_pipeline(name, definition, role_arn).await
    }

    async fn start_execution(&self, pipeline_name: &str) -> Result<Execution> {
        (**self).start_execution(pipeline_name).await
    }

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription> {
        (**self).describe_execution(execution_id).await
    }
}
