//! Local history of started executions

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

pub use crate::core::ExecutionStatus;
use crate::core::{Execution, ExecutionDescription};
use crate::execution::ExecutionEvent;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Summary of a pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Backend-assigned execution ID
    pub execution_id: String,

    pub pipeline_name: String,

    /// Last status seen
    pub status: ExecutionStatus,

    pub started_at: DateTime<Utc>,

    /// Set once the execution reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    pub completed_steps: usize,

    pub total_steps: usize,
}

impl ExecutionSummary {
    /// Summary of an execution that was just started
    pub fn started(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            pipeline_name: execution.pipeline_name.clone(),
            status: ExecutionStatus::Pending,
            started_at: execution.started_at,
            completed_at: None,
            progress: 0.0,
            completed_steps: 0,
            total_steps: 0,
        }
    }

    /// Track status changes of this execution from session events, so the
    /// last status seen is known even when waiting ends in an error
    pub fn observe(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::StatusChanged {
                execution_id,
                status,
                progress,
            } if *execution_id == self.execution_id => {
                self.status = *status;
                self.progress = *progress;
            }
            ExecutionEvent::ExecutionFinished {
                execution_id,
                status,
                ..
            } if *execution_id == self.execution_id => {
                self.status = *status;
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
    }
}

/// Summary from the latest description of an execution
pub fn summarize(execution: &Execution, description: &ExecutionDescription) -> ExecutionSummary {
    ExecutionSummary {
        execution_id: execution.execution_id.clone(),
        pipeline_name: execution.pipeline_name.clone(),
        status: description.status,
        started_at: execution.started_at,
        completed_at: description
            .status
            .is_terminal()
            .then_some(description.last_modified_time),
        progress: description.progress(),
        completed_steps: description
            .steps
            .iter()
            .filter(|s| s.step_status.is_terminal())
            .count(),
        total_steps: description.steps.len(),
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Insert or replace the summary stored under its execution ID
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()>;

    async fn load_execution(&self, execution_id: &str) -> Result<Option<ExecutionSummary>>;

    /// Executions of one pipeline, newest first
    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>>;

    /// Most recent executions across all pipelines, newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionSummary>>;

    /// All pipeline names, sorted
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    executions: RwLock<HashMap<String, ExecutionSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(mut summaries: Vec<ExecutionSummary>) -> Vec<ExecutionSummary> {
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    summaries
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        self.executions
            .write()
            .await
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: &str) -> Result<Option<ExecutionSummary>> {
        Ok(self.executions.read().await.get(execution_id).cloned())
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        let execs = self.executions.read().await;
        Ok(newest_first(
            execs
                .values()
                .filter(|e| e.pipeline_name == pipeline_name)
                .cloned()
                .collect(),
        ))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let execs = self.executions.read().await;
        let mut recent = newest_first(execs.values().cloned().collect());
        recent.truncate(limit);
        Ok(recent)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let execs = self.executions.read().await;
        let mut names: Vec<String> = execs.values().map(|e| e.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
