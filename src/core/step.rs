//! Step domain model

use crate::core::reference::OutputRef;
use crate::error::{PipelineError, Result};
use std::collections::BTreeMap;

/// Default container mount points used by managed jobs
pub const PROCESSING_INPUT_PATH: &str = "/opt/ml/processing/input";
pub const PROCESSING_OUTPUT_PATH: &str = "/opt/ml/processing/output";

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique step name within the pipeline
    pub name: String,

    /// What the step does
    pub kind: StepKind,

    /// Upstream step names this step waits for
    pub depends_on: Vec<String>,
}

/// Kind-specific step configuration
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Processing(ProcessingSpec),
    Training(TrainingSpec),
    Model(ModelSpec),
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Processing(_) => "processing",
            StepKind::Training(_) => "training",
            StepKind::Model(_) => "model",
        }
    }
}

/// Compute shape for a managed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub instance_type: String,
    pub instance_count: u32,
    pub volume_size_gb: u32,
}

impl ResourceSpec {
    pub fn new(instance_type: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            instance_count: 1,
            volume_size_gb: 30,
        }
    }

    pub fn with_instance_count(mut self, count: u32) -> Self {
        self.instance_count = count;
        self
    }

    pub fn with_volume_size_gb(mut self, size: u32) -> Self {
        self.volume_size_gb = size;
        self
    }

    fn validate(&self, step: &str) -> Result<()> {
        if self.instance_type.trim().is_empty() {
            return Err(PipelineError::invalid(format!(
                "Step '{}' has an empty instance type",
                step
            )));
        }
        if self.instance_count == 0 {
            return Err(PipelineError::invalid(format!(
                "Step '{}' must request at least one instance",
                step
            )));
        }
        Ok(())
    }
}

/// Where a step reads an input from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Concrete object storage location known at definition time
    Uri(String),
    /// Value produced by another step, resolved by the backend
    Step(OutputRef),
}

impl InputSource {
    pub fn reference(&self) -> Option<&OutputRef> {
        match self {
            InputSource::Uri(_) => None,
            InputSource::Step(r) => Some(r),
        }
    }
}

impl From<OutputRef> for InputSource {
    fn from(r: OutputRef) -> Self {
        InputSource::Step(r)
    }
}

impl From<&str> for InputSource {
    fn from(uri: &str) -> Self {
        InputSource::Uri(uri.to_string())
    }
}

impl From<String> for InputSource {
    fn from(uri: String) -> Self {
        InputSource::Uri(uri)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingInput {
    pub source: InputSource,
    /// Mount path inside the job container
    pub destination: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOutput {
    /// Name other steps use to reference this output
    pub output_name: String,
    /// Mount path inside the job container
    pub source: String,
    /// Durable storage destination
    pub destination: String,
}

/// Data-transformation job
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSpec {
    pub image_uri: String,
    pub command: Vec<String>,
    pub code: Option<String>,
    pub role_arn: Option<String>,
    pub resources: ResourceSpec,
    pub inputs: Vec<ProcessingInput>,
    pub outputs: Vec<ProcessingOutput>,
    pub environment: BTreeMap<String, String>,
}

/// Model-fitting job
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSpec {
    pub image_uri: String,
    pub entry_point: Option<String>,
    pub source_dir: Option<String>,
    pub role_arn: Option<String>,
    pub resources: ResourceSpec,
    pub hyperparameters: BTreeMap<String, String>,
    /// Input channels by name (e.g. `train`)
    pub channels: BTreeMap<String, InputSource>,
    pub output_path: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub max_runtime_secs: u64,
}

/// Wraps trained artifacts as a deployable model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub model_data: InputSource,
    pub image_uri: String,
    pub role_arn: Option<String>,
    pub action: ModelAction,
}

/// Terminal action of a model step
#[derive(Debug, Clone, PartialEq)]
pub enum ModelAction {
    /// Register a new package version in a model package group
    Register(RegisterSpec),
    /// Deploy to a live inference endpoint
    Deploy(DeploySpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSpec {
    pub model_package_group: String,
    pub content_types: Vec<String>,
    pub response_types: Vec<String>,
    pub inference_instances: Vec<String>,
    pub transform_instances: Vec<String>,
    pub approval_status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySpec {
    pub endpoint_name: String,
    pub instance_type: String,
    pub initial_instance_count: u32,
}

impl Step {
    /// Reference a named output of this step.
    ///
    /// Fails with `OutputNameMismatch` when the step declares no such output.
    pub fn output(&self, output_name: &str) -> Result<OutputRef> {
        match &self.kind {
            StepKind::Processing(spec) => {
                if spec.outputs.iter().any(|o| o.output_name == output_name) {
                    Ok(OutputRef::processing_output(&self.name, output_name))
                } else {
                    Err(PipelineError::OutputNameMismatch {
                        source_step: self.name.clone(),
                        output: output_name.to_string(),
                        declared: self.output_names(),
                    })
                }
            }
            other => Err(PipelineError::invalid(format!(
                "Step '{}' is a {} step and has no named outputs",
                self.name,
                other.label()
            ))),
        }
    }

    /// Reference this training step's model artifacts
    pub fn model_artifacts(&self) -> Result<OutputRef> {
        match &self.kind {
            StepKind::Training(_) => Ok(OutputRef::model_artifacts(&self.name)),
            other => Err(PipelineError::invalid(format!(
                "Step '{}' is a {} step and produces no model artifacts",
                self.name,
                other.label()
            ))),
        }
    }

    /// Hyperparameters of a training step
    pub fn hyperparameters(&self) -> Option<&BTreeMap<String, String>> {
        match &self.kind {
            StepKind::Training(spec) => Some(&spec.hyperparameters),
            _ => None,
        }
    }

    /// Names of the outputs this step declares
    pub fn output_names(&self) -> Vec<String> {
        match &self.kind {
            StepKind::Processing(spec) => {
                spec.outputs.iter().map(|o| o.output_name.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Whether `reference` names something this step actually produces
    pub fn produces(&self, reference: &OutputRef) -> bool {
        match (reference.output_name(), &self.kind) {
            (Some(name), StepKind::Processing(spec)) => {
                spec.outputs.iter().any(|o| o.output_name == name)
            }
            (None, StepKind::Training(_)) => true,
            _ => false,
        }
    }

    /// Every symbolic reference embedded in this step's inputs
    pub fn references(&self) -> Vec<&OutputRef> {
        match &self.kind {
            StepKind::Processing(spec) => spec
                .inputs
                .iter()
                .filter_map(|i| i.source.reference())
                .collect(),
            StepKind::Training(spec) => spec
                .channels
                .values()
                .filter_map(InputSource::reference)
                .collect(),
            StepKind::Model(spec) => spec.model_data.reference().into_iter().collect(),
        }
    }

    /// Check the step on its own, without the rest of the pipeline
    pub fn validate(&self) -> Result<()> {
        validate_step_name(&self.name)?;

        match &self.kind {
            StepKind::Processing(spec) => {
                require_non_empty(&self.name, "image_uri", &spec.image_uri)?;
                spec.resources.validate(&self.name)?;
                let mut seen = std::collections::HashSet::new();
                for output in &spec.outputs {
                    require_non_empty(&self.name, "output_name", &output.output_name)?;
                    require_non_empty(&self.name, "output destination", &output.destination)?;
                    if !seen.insert(output.output_name.as_str()) {
                        return Err(PipelineError::invalid(format!(
                            "Step '{}' declares output '{}' twice",
                            self.name, output.output_name
                        )));
                    }
                }
                for input in &spec.inputs {
                    if let InputSource::Uri(uri) = &input.source {
                        require_non_empty(&self.name, "input source", uri)?;
                    }
                    require_non_empty(&self.name, "input destination", &input.destination)?;
                }
            }
            StepKind::Training(spec) => {
                require_non_empty(&self.name, "image_uri", &spec.image_uri)?;
                spec.resources.validate(&self.name)?;
                if spec.channels.is_empty() {
                    return Err(PipelineError::invalid(format!(
                        "Training step '{}' has no input channels",
                        self.name
                    )));
                }
                for (channel, source) in &spec.channels {
                    if let InputSource::Uri(uri) = source {
                        require_non_empty(&self.name, channel, uri)?;
                    }
                }
            }
            StepKind::Model(spec) => {
                require_non_empty(&self.name, "image_uri", &spec.image_uri)?;
                if let InputSource::Step(r) = &spec.model_data {
                    if r.output_name().is_some() {
                        return Err(PipelineError::invalid(format!(
                            "Model step '{}' must take model artifacts of a training step, not processing output '{}'",
                            self.name, r
                        )));
                    }
                }
                match &spec.action {
                    ModelAction::Register(register) => {
                        require_non_empty(
                            &self.name,
                            "model_package_group",
                            &register.model_package_group,
                        )?;
                    }
                    ModelAction::Deploy(deploy) => {
                        require_non_empty(&self.name, "endpoint_name", &deploy.endpoint_name)?;
                        require_non_empty(&self.name, "instance_type", &deploy.instance_type)?;
                        if deploy.initial_instance_count == 0 {
                            return Err(PipelineError::invalid(format!(
                                "Step '{}' must deploy at least one instance",
                                self.name
                            )));
                        }
                    }
                }
            }
        }

        if self.depends_on.iter().any(|d| d == &self.name) {
            return Err(PipelineError::invalid(format!(
                "Step '{}' depends on itself",
                self.name
            )));
        }

        Ok(())
    }
}

/// Step names: 1-64 chars of ASCII alphanumerics, `-` or `_`, starting alphanumeric
pub fn validate_step_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::invalid(format!("Invalid step name '{}'", name)))
    }
}

fn require_non_empty(step: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(PipelineError::invalid(format!(
            "Step '{}' has an empty {}",
            step, field
        )))
    } else {
        Ok(())
    }
}

/// Builder for a processing step
#[derive(Debug, Clone)]
pub struct ProcessingStep {
    name: String,
    spec: ProcessingSpec,
    depends_on: Vec<String>,
}

impl ProcessingStep {
    pub fn new(name: impl Into<String>, image_uri: impl Into<String>, resources: ResourceSpec) -> Self {
        Self {
            name: name.into(),
            spec: ProcessingSpec {
                image_uri: image_uri.into(),
                command: Vec::new(),
                code: None,
                role_arn: None,
                resources,
                inputs: Vec::new(),
                outputs: Vec::new(),
                environment: BTreeMap::new(),
            },
            depends_on: Vec::new(),
        }
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.spec.code = Some(code.into());
        self
    }

    pub fn role(mut self, role_arn: impl Into<String>) -> Self {
        self.spec.role_arn = Some(role_arn.into());
        self
    }

    pub fn input(mut self, source: impl Into<InputSource>, destination: impl Into<String>) -> Self {
        self.spec.inputs.push(ProcessingInput {
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    /// Declare a named output; the name has no default and must match what
    /// downstream steps reference
    pub fn output(
        mut self,
        output_name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        self.spec.outputs.push(ProcessingOutput {
            output_name: output_name.into(),
            source: source.into(),
            destination: destination.into(),
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn build(self) -> Result<Step> {
        let step = Step {
            name: self.name,
            kind: StepKind::Processing(self.spec),
            depends_on: self.depends_on,
        };
        step.validate()?;
        Ok(step)
    }
}

/// Builder for a training step
#[derive(Debug, Clone)]
pub struct TrainingStep {
    name: String,
    spec: TrainingSpec,
    depends_on: Vec<String>,
}

impl TrainingStep {
    pub fn new(name: impl Into<String>, image_uri: impl Into<String>, resources: ResourceSpec) -> Self {
        Self {
            name: name.into(),
            spec: TrainingSpec {
                image_uri: image_uri.into(),
                entry_point: None,
                source_dir: None,
                role_arn: None,
                resources,
                hyperparameters: BTreeMap::new(),
                channels: BTreeMap::new(),
                output_path: None,
                environment: BTreeMap::new(),
                max_runtime_secs: 86_400,
            },
            depends_on: Vec::new(),
        }
    }

    pub fn entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.spec.entry_point = Some(entry_point.into());
        self
    }

    pub fn source_dir(mut self, source_dir: impl Into<String>) -> Self {
        self.spec.source_dir = Some(source_dir.into());
        self
    }

    pub fn role(mut self, role_arn: impl Into<String>) -> Self {
        self.spec.role_arn = Some(role_arn.into());
        self
    }

    pub fn hyperparameter(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.spec.hyperparameters.insert(key.into(), value.to_string());
        self
    }

    pub fn channel(mut self, name: impl Into<String>, source: impl Into<InputSource>) -> Self {
        self.spec.channels.insert(name.into(), source.into());
        self
    }

    pub fn output_path(mut self, uri: impl Into<String>) -> Self {
        self.spec.output_path = Some(uri.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.insert(key.into(), value.into());
        self
    }

    pub fn max_runtime_secs(mut self, secs: u64) -> Self {
        self.spec.max_runtime_secs = secs;
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn build(self) -> Result<Step> {
        let step = Step {
            name: self.name,
            kind: StepKind::Training(self.spec),
            depends_on: self.depends_on,
        };
        step.validate()?;
        Ok(step)
    }
}

/// Builder for a model registration or deployment step
#[derive(Debug, Clone)]
pub struct ModelStep {
    name: String,
    spec: ModelSpec,
    depends_on: Vec<String>,
}

impl ModelStep {
    /// Register the model under a model package group
    pub fn register(
        name: impl Into<String>,
        model_data: impl Into<InputSource>,
        image_uri: impl Into<String>,
        model_package_group: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            spec: ModelSpec {
                model_data: model_data.into(),
                image_uri: image_uri.into(),
                role_arn: None,
                action: ModelAction::Register(RegisterSpec {
                    model_package_group: model_package_group.into(),
                    content_types: vec!["text/csv".to_string()],
                    response_types: vec!["text/csv".to_string()],
                    inference_instances: Vec::new(),
                    transform_instances: Vec::new(),
                    approval_status: "PendingManualApproval".to_string(),
                }),
            },
            depends_on: Vec::new(),
        }
    }

    /// Deploy the model to a live endpoint
    pub fn deploy(
        name: impl Into<String>,
        model_data: impl Into<InputSource>,
        image_uri: impl Into<String>,
        endpoint_name: impl Into<String>,
        instance_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            spec: ModelSpec {
                model_data: model_data.into(),
                image_uri: image_uri.into(),
                role_arn: None,
                action: ModelAction::Deploy(DeploySpec {
                    endpoint_name: endpoint_name.into(),
                    instance_type: instance_type.into(),
                    initial_instance_count: 1,
                }),
            },
            depends_on: Vec::new(),
        }
    }

    pub fn role(mut self, role_arn: impl Into<String>) -> Self {
        self.spec.role_arn = Some(role_arn.into());
        self
    }

    /// Content/response types and instance types; ignored for deployments
    pub fn supported(
        mut self,
        content_types: Vec<String>,
        response_types: Vec<String>,
        inference_instances: Vec<String>,
        transform_instances: Vec<String>,
    ) -> Self {
        if let ModelAction::Register(register) = &mut self.spec.action {
            register.content_types = content_types;
            register.response_types = response_types;
            register.inference_instances = inference_instances;
            register.transform_instances = transform_instances;
        }
        self
    }

    pub fn approval_status(mut self, status: impl Into<String>) -> Self {
        if let ModelAction::Register(register) = &mut self.spec.action {
            register.approval_status = status.into();
        }
        self
    }

    pub fn initial_instance_count(mut self, count: u32) -> Self {
        if let ModelAction::Deploy(deploy) = &mut self.spec.action {
            deploy.initial_instance_count = count;
        }
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn build(self) -> Result<Step> {
        let step = Step {
            name: self.name,
            kind: StepKind::Model(self.spec),
            depends_on: self.depends_on,
        };
        step.validate()?;
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocess() -> Step {
        ProcessingStep::new("PreprocessIrisData", "image:latest", ResourceSpec::new("ml.t3.medium"))
            .command(["python3"])
            .code("src/preprocessing.py")
            .input("s3://bucket/iris-dataset/", PROCESSING_INPUT_PATH)
            .output("ProcessedData", PROCESSING_OUTPUT_PATH, "s3://bucket/iris-output/")
            .build()
            .unwrap()
    }

    #[test]
    fn test_output_reference_for_declared_name() {
        let step = preprocess();
        let r = step.output("ProcessedData").unwrap();
        assert_eq!(r.step(), "PreprocessIrisData");
        assert_eq!(r.output_name(), Some("ProcessedData"));
    }

    #[test]
    fn test_output_reference_for_undeclared_name_fails() {
        let step = preprocess();
        let err = step.output("ProcessingOutput").unwrap_err();
        match err {
            PipelineError::OutputNameMismatch { source_step, output, declared, .. } => {
                assert_eq!(source_step, "PreprocessIrisData");
                assert_eq!(output, "ProcessingOutput");
                assert_eq!(declared, vec!["ProcessedData".to_string()]);
            }
            other => panic!("Expected OutputNameMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_model_artifacts_only_from_training() {
        let step = preprocess();
        assert!(matches!(
            step.model_artifacts(),
            Err(PipelineError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_training_step_collects_references() {
        let pre = preprocess();
        let train = TrainingStep::new("TrainIrisModel", "image:latest", ResourceSpec::new("ml.c4.xlarge"))
            .entry_point("train.py")
            .hyperparameter("max_leaf_nodes", 30)
            .channel("train", pre.output("ProcessedData").unwrap())
            .depends_on(&pre.name)
            .build()
            .unwrap();

        assert_eq!(train.references().len(), 1);
        assert_eq!(
            train.hyperparameters().and_then(|h| h.get("max_leaf_nodes")),
            Some(&"30".to_string())
        );
        assert!(pre.produces(train.references()[0]));
    }

    #[test]
    fn test_duplicate_output_names_rejected() {
        let result = ProcessingStep::new("Pre", "image", ResourceSpec::new("ml.t3.medium"))
            .output("Out", "/a", "s3://a")
            .output("Out", "/b", "s3://b")
            .build();
        assert!(matches!(result, Err(PipelineError::InvalidDefinition(_))));
    }

    #[test]
    fn test_zero_instances_rejected() {
        let result = ProcessingStep::new(
            "Pre",
            "image",
            ResourceSpec::new("ml.t3.medium").with_instance_count(0),
        )
        .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_step_name_rules() {
        assert!(validate_step_name("TrainIrisModel").is_ok());
        assert!(validate_step_name("train-iris_2").is_ok());
        assert!(validate_step_name("").is_err());
        assert!(validate_step_name("-leading").is_err());
        assert!(validate_step_name("has space").is_err());
        assert!(validate_step_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_model_step_rejects_processing_output_source() {
        let result = ModelStep::register(
            "Register",
            OutputRef::processing_output("Pre", "ProcessedData"),
            "image",
            "IrisModelPackageGroup",
        )
        .build();
        assert!(matches!(result, Err(PipelineError::InvalidDefinition(_))));
    }
}
