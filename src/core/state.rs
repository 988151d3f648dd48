//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of a pipeline execution as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Accepted but not yet running
    Pending,
    /// Steps are running
    Executing,
    /// A stop was requested outside this tool
    Stopping,
    /// Stopped before finishing
    Stopped,
    /// All steps completed successfully
    Succeeded,
    /// A step failed
    Failed,
}

impl ExecutionStatus {
    /// Check if execution is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Executing => "Executing",
            ExecutionStatus::Stopping => "Stopping",
            ExecutionStatus::Stopped => "Stopped",
            ExecutionStatus::Succeeded => "Succeeded",
            ExecutionStatus::Failed => "Failed",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ExecutionStatus::Pending),
            "Executing" => Ok(ExecutionStatus::Executing),
            "Stopping" => Ok(ExecutionStatus::Stopping),
            "Stopped" => Ok(ExecutionStatus::Stopped),
            "Succeeded" => Ok(ExecutionStatus::Succeeded),
            "Failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("Unknown execution status: {}", other)),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Waiting for upstream steps
    Pending,
    Executing,
    Succeeded,
    Failed,
    /// Never started because an upstream step failed
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Handle to a started execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Backend-assigned execution identifier
    pub execution_id: String,

    pub pipeline_name: String,

    pub started_at: DateTime<Utc>,
}

/// One step of an execution, with the values the backend resolved for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepExecution {
    pub step_name: String,

    pub step_status: StepStatus,

    /// Symbolic input references (by path) resolved to the values used
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,

    /// Concrete outputs, e.g. an output name mapped to its storage URI
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Snapshot of an execution returned by `describe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionDescription {
    #[serde(rename = "PipelineExecutionArn")]
    pub execution_id: String,

    pub pipeline_name: String,

    #[serde(rename = "PipelineExecutionStatus")]
    pub status: ExecutionStatus,

    #[serde(default)]
    pub failure_reason: Option<String>,

    pub creation_time: DateTime<Utc>,

    pub last_modified_time: DateTime<Utc>,

    #[serde(default)]
    pub steps: Vec<StepExecution>,
}

impl ExecutionDescription {
    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    /// Calculate progress (0.0 to 1.0) from step statuses
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return if self.status.is_terminal() { 1.0 } else { 0.0 };
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.step_status.is_terminal())
            .count();
        done as f64 / self.steps.len() as f64
    }
}
