//! Symbolic references to values a step produces at execution time
//!
//! A reference is a placeholder embedded in another step's definition. The
//! orchestration backend substitutes the concrete value (an object storage
//! URI) once the producing step has run; the definer never sees it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which property of the producing step a reference points at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputProperty {
    /// Destination URI of a named processing output
    ProcessingOutput { output_name: String },
    /// Location of a training step's model artifacts
    ModelArtifacts,
}

/// Lazily-resolved pointer to another step's output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    step: String,
    property: OutputProperty,
}

impl OutputRef {
    /// Reference a named processing output.
    ///
    /// The name is checked against the producing step when the pipeline is
    /// assembled; prefer [`crate::core::Step::output`] when the step value is
    /// at hand.
    pub fn processing_output(step: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            property: OutputProperty::ProcessingOutput {
                output_name: output_name.into(),
            },
        }
    }

    /// Reference a training step's model artifacts
    pub fn model_artifacts(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            property: OutputProperty::ModelArtifacts,
        }
    }

    /// Name of the producing step
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn property(&self) -> &OutputProperty {
        &self.property
    }

    /// Output name for processing references
    pub fn output_name(&self) -> Option<&str> {
        match &self.property {
            OutputProperty::ProcessingOutput { output_name } => Some(output_name),
            OutputProperty::ModelArtifacts => None,
        }
    }

    /// Property path understood by the backend
    pub fn path(&self) -> String {
        match &self.property {
            OutputProperty::ProcessingOutput { output_name } => format!(
                "Steps.{}.ProcessingOutputConfig.Outputs['{}'].S3Output.S3Uri",
                self.step, output_name
            ),
            OutputProperty::ModelArtifacts => {
                format!("Steps.{}.ModelArtifacts.S3ModelArtifacts", self.step)
            }
        }
    }

    /// JSON form embedded in a pipeline definition
    pub fn to_json(&self) -> Value {
        json!({ "Get": self.path() })
    }

    /// Parse a property path back into a reference
    pub fn parse_path(path: &str) -> Option<Self> {
        let rest = path.strip_prefix("Steps.")?;
        let (step, property) = rest.split_once('.')?;
        if step.is_empty() {
            return None;
        }

        if property == "ModelArtifacts.S3ModelArtifacts" {
            return Some(Self::model_artifacts(step));
        }

        let name = property
            .strip_prefix("ProcessingOutputConfig.Outputs['")?
            .strip_suffix("'].S3Output.S3Uri")?;
        if name.is_empty() {
            return None;
        }
        Some(Self::processing_output(step, name))
    }

    /// Extract a reference from a `{"Get": "..."}` JSON value
    pub fn from_json(value: &Value) -> Option<Self> {
        value
            .as_object()
            .filter(|map| map.len() == 1)
            .and_then(|map| map.get("Get"))
            .and_then(Value::as_str)
            .and_then(Self::parse_path)
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}
