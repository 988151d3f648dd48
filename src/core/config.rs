//! Pipeline configuration from YAML

use crate::core::{
    pipeline::Pipeline,
    reference::OutputRef,
    step::{
        InputSource, ModelStep, ProcessingStep, ResourceSpec, Step, TrainingStep,
        PROCESSING_INPUT_PATH, PROCESSING_OUTPUT_PATH,
    },
};
use crate::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// `{{ name }}` placeholders in string values
const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}";

/// Variable definition - a literal string or a value taken from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableDefinition {
    /// Simple string value
    String(String),
    /// Environment variable; a missing required variable is an error
    Env { name: String, required: bool },
}

impl VariableDefinition {
    fn from_yaml(key: &str, value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(VariableDefinition::String(s.clone())),
            Value::Number(n) => Ok(VariableDefinition::String(n.to_string())),
            Value::Bool(b) => Ok(VariableDefinition::String(b.to_string())),
            Value::Mapping(map) => {
                let name = map
                    .get("env")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        PipelineError::Config(format!(
                            "Variable '{}' must be a string or {{ env: NAME }}",
                            key
                        ))
                    })?
                    .to_string();
                let required = map
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Ok(VariableDefinition::Env { name, required })
            }
            _ => Err(PipelineError::Config(format!(
                "Variable '{}' must be a string or {{ env: NAME }}",
                key
            ))),
        }
    }

    /// Resolve to the value substituted into the definition
    pub fn resolve(&self, key: &str) -> Result<String> {
        match self {
            VariableDefinition::String(s) => Ok(s.clone()),
            VariableDefinition::Env { name, required } => match std::env::var(name) {
                Ok(value) => Ok(value),
                Err(_) if !required => Ok(String::new()),
                Err(_) => Err(PipelineError::Config(format!(
                    "Variable '{}' requires environment variable {} to be set",
                    key, name
                ))),
            },
        }
    }
}

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Execution role for steps that don't set their own
    #[serde(default)]
    pub role_arn: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Variables substituted into `{{ name }}` placeholders
    #[serde(default)]
    variables: BTreeMap<String, Value>,

    /// Pipeline steps
    pub steps: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    Processing(ProcessingStepConfig),
    Training(TrainingStepConfig),
    Model(ModelStepConfig),
}

impl StepConfig {
    pub fn name(&self) -> &str {
        match self {
            StepConfig::Processing(c) => &c.name,
            StepConfig::Training(c) => &c.name,
            StepConfig::Model(c) => &c.name,
        }
    }
}

/// Input location: a URI, a named processing output, or training model artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceConfig {
    Uri(String),
    StepOutput { step: String, output: String },
    ModelArtifacts { step: String },
}

impl SourceConfig {
    fn to_source(&self) -> InputSource {
        match self {
            SourceConfig::Uri(uri) => InputSource::Uri(uri.clone()),
            SourceConfig::StepOutput { step, output } => {
                InputSource::Step(OutputRef::processing_output(step, output))
            }
            SourceConfig::ModelArtifacts { step } => {
                InputSource::Step(OutputRef::model_artifacts(step))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingInputConfig {
    pub source: SourceConfig,

    #[serde(default = "default_input_path")]
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOutputConfig {
    /// Required: there is no default output name
    pub output_name: String,

    #[serde(default = "default_output_path")]
    pub source: String,

    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStepConfig {
    pub name: String,

    pub image_uri: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub role_arn: Option<String>,

    pub instance_type: String,

    #[serde(default = "default_instance_count")]
    pub instance_count: u32,

    #[serde(default = "default_volume_size")]
    pub volume_size_gb: u32,

    #[serde(default)]
    pub inputs: Vec<ProcessingInputConfig>,

    #[serde(default)]
    pub outputs: Vec<ProcessingOutputConfig>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStepConfig {
    pub name: String,

    pub image_uri: String,

    #[serde(default)]
    pub entry_point: Option<String>,

    #[serde(default)]
    pub source_dir: Option<String>,

    #[serde(default)]
    pub role_arn: Option<String>,

    pub instance_type: String,

    #[serde(default = "default_instance_count")]
    pub instance_count: u32,

    #[serde(default = "default_volume_size")]
    pub volume_size_gb: u32,

    /// Values are passed to the job as strings
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, Value>,

    /// Input channels by name
    pub inputs: BTreeMap<String, SourceConfig>,

    #[serde(default)]
    pub output_path: Option<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub max_runtime_secs: Option<u64>,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub model_package_group: String,

    #[serde(default = "default_mime_types")]
    pub content_types: Vec<String>,

    #[serde(default = "default_mime_types")]
    pub response_types: Vec<String>,

    #[serde(default)]
    pub inference_instances: Vec<String>,

    #[serde(default)]
    pub transform_instances: Vec<String>,

    #[serde(default)]
    pub approval_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub endpoint_name: String,

    pub instance_type: String,

    #[serde(default = "default_instance_count")]
    pub initial_instance_count: u32,
}

/// Exactly one of `register` or `deploy` must be set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStepConfig {
    pub name: String,

    pub model_data: SourceConfig,

    pub image_uri: String,

    #[serde(default)]
    pub role_arn: Option<String>,

    #[serde(default)]
    pub register: Option<RegisterConfig>,

    #[serde(default)]
    pub deploy: Option<DeployConfig>,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_input_path() -> String {
    PROCESSING_INPUT_PATH.to_string()
}

fn default_output_path() -> String {
    PROCESSING_OUTPUT_PATH.to_string()
}

fn default_instance_count() -> u32 {
    1
}

fn default_volume_size() -> u32 {
    30
}

fn default_mime_types() -> Vec<String> {
    vec!["text/csv".to_string()]
}

fn yaml_scalar_to_string(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(PipelineError::invalid(format!(
            "Hyperparameter '{}' must be a scalar",
            key
        ))),
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_overrides(path, &HashMap::new())
    }

    /// Load from a file, overriding YAML variables
    pub fn from_file_with_overrides<P: AsRef<Path>>(
        path: P,
        overrides: &HashMap<String, String>,
    ) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_with_overrides(&content, overrides)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_overrides(yaml, &HashMap::new())
    }

    /// Parse, substitute variables (overrides win over YAML), and validate
    pub fn from_yaml_with_overrides(
        yaml: &str,
        overrides: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut root: Value = serde_yaml::from_str(yaml)?;

        let mut values = HashMap::new();
        if let Some(Value::Mapping(vars)) = root.get("variables") {
            for (key, value) in vars {
                let key = key.as_str().ok_or_else(|| {
                    PipelineError::Config("Variable names must be strings".to_string())
                })?;
                if overrides.contains_key(key) {
                    continue;
                }
                let definition = VariableDefinition::from_yaml(key, value)?;
                values.insert(key.to_string(), definition.resolve(key)?);
            }
        }
        values.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let placeholder = Regex::new(PLACEHOLDER)
            .map_err(|e| PipelineError::Config(format!("Bad placeholder pattern: {}", e)))?;
        if let Value::Mapping(map) = &mut root {
            for (key, value) in map.iter_mut() {
                if key.as_str() == Some("variables") {
                    continue;
                }
                substitute(value, &values, &placeholder)?;
            }
        }

        let config: PipelineConfig = serde_yaml::from_value(root)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration by assembling the pipeline it describes
    pub fn validate(&self) -> Result<()> {
        self.to_pipeline().map(|_| ())
    }

    /// Get variables as parsed VariableDefinition enum
    pub fn get_variables(&self) -> Result<BTreeMap<String, VariableDefinition>> {
        self.variables
            .iter()
            .map(|(k, v)| Ok((k.clone(), VariableDefinition::from_yaml(k, v)?)))
            .collect()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        let steps = self
            .steps
            .iter()
            .map(StepConfig::to_step)
            .collect::<Result<Vec<_>>>()?;
        Pipeline::new(&self.name, steps)
    }
}

impl StepConfig {
    fn to_step(&self) -> Result<Step> {
        match self {
            StepConfig::Processing(c) => {
                let resources = ResourceSpec::new(&c.instance_type)
                    .with_instance_count(c.instance_count)
                    .with_volume_size_gb(c.volume_size_gb);
                let mut builder = ProcessingStep::new(&c.name, &c.image_uri, resources)
                    .command(c.command.iter().cloned());
                if let Some(code) = &c.code {
                    builder = builder.code(code);
                }
                if let Some(role) = &c.role_arn {
                    builder = builder.role(role);
                }
                for input in &c.inputs {
                    builder = builder.input(input.source.to_source(), &input.destination);
                }
                for output in &c.outputs {
                    builder = builder.output(&output.output_name, &output.source, &output.destination);
                }
                for (k, v) in &c.environment {
                    builder = builder.env(k, v);
                }
                for dep in &c.depends_on {
                    builder = builder.depends_on(dep);
                }
                builder.build()
            }
            StepConfig::Training(c) => {
                let resources = ResourceSpec::new(&c.instance_type)
                    .with_instance_count(c.instance_count)
                    .with_volume_size_gb(c.volume_size_gb);
                let mut builder = TrainingStep::new(&c.name, &c.image_uri, resources);
                if let Some(entry_point) = &c.entry_point {
                    builder = builder.entry_point(entry_point);
                }
                if let Some(source_dir) = &c.source_dir {
                    builder = builder.source_dir(source_dir);
                }
                if let Some(role) = &c.role_arn {
                    builder = builder.role(role);
                }
                for (k, v) in &c.hyperparameters {
                    builder = builder.hyperparameter(k, yaml_scalar_to_string(k, v)?);
                }
                for (channel, source) in &c.inputs {
                    builder = builder.channel(channel, source.to_source());
                }
                if let Some(output_path) = &c.output_path {
                    builder = builder.output_path(output_path);
                }
                for (k, v) in &c.environment {
                    builder = builder.env(k, v);
                }
                if let Some(secs) = c.max_runtime_secs {
                    builder = builder.max_runtime_secs(secs);
                }
                for dep in &c.depends_on {
                    builder = builder.depends_on(dep);
                }
                builder.build()
            }
            StepConfig::Model(c) => {
                let source = c.model_data.to_source();
                let mut builder = match (&c.register, &c.deploy) {
                    (Some(register), None) => {
                        let mut builder =
                            ModelStep::register(&c.name, source, &c.image_uri, &register.model_package_group)
                                .supported(
                                    register.content_types.clone(),
                                    register.response_types.clone(),
                                    register.inference_instances.clone(),
                                    register.transform_instances.clone(),
                                );
                        if let Some(status) = &register.approval_status {
                            builder = builder.approval_status(status);
                        }
                        builder
                    }
                    (None, Some(deploy)) => ModelStep::deploy(
                        &c.name,
                        source,
                        &c.image_uri,
                        &deploy.endpoint_name,
                        &deploy.instance_type,
                    )
                    .initial_instance_count(deploy.initial_instance_count),
                    _ => {
                        return Err(PipelineError::invalid(format!(
                            "Model step '{}' must set exactly one of 'register' or 'deploy'",
                            c.name
                        )))
                    }
                };
                if let Some(role) = &c.role_arn {
                    builder = builder.role(role);
                }
                for dep in &c.depends_on {
                    builder = builder.depends_on(dep);
                }
                builder.build()
            }
        }
    }
}

/// Replace placeholders in every string of a YAML tree
fn substitute(value: &mut Value, values: &HashMap<String, String>, placeholder: &Regex) -> Result<()> {
    match value {
        Value::String(s) => {
            if let Some(missing) = placeholder
                .captures_iter(s)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str())
                .find(|name| !values.contains_key(*name))
            {
                return Err(PipelineError::invalid(format!(
                    "Undefined variable '{}' in \"{}\"",
                    missing, s
                )));
            }
            let replaced = placeholder.replace_all(s, |caps: &regex::Captures| {
                values.get(&caps[1]).cloned().unwrap_or_default()
            });
            *s = replaced.into_owned();
        }
        Value::Sequence(items) => {
            for item in items {
                substitute(item, values, placeholder)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                substitute(item, values, placeholder)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::StepKind;

    const IRIS_YAML: &str = r#"
name: "iris-mlflow-pipeline"
role_arn: "arn:aws:iam::000000000000:role/pipeline-execution"

variables:
  bucket: "s3://example-bucket"
  image: "registry.example.com/iris:latest"

steps:
  - kind: processing
    name: PreprocessIrisData
    image_uri: "{{ image }}"
    command: ["python3"]
    code: src/preprocessing.py
    instance_type: ml.t3.medium
    inputs:
      - source: "{{ bucket }}/iris-dataset/"
    outputs:
      - output_name: ProcessedData
        destination: "{{bucket}}/iris-output/"

  - kind: training
    name: TrainIrisModel
    image_uri: "{{ image }}"
    entry_point: train.py
    source_dir: src
    instance_type: ml.c4.xlarge
    hyperparameters:
      max_leaf_nodes: 30
    inputs:
      train:
        step: PreprocessIrisData
        output: ProcessedData
    depends_on: [PreprocessIrisData]

  - kind: model
    name: RegisterIrisModel
    image_uri: "{{ image }}"
    model_data:
      step: TrainIrisModel
    register:
      model_package_group: IrisModelPackageGroup
      inference_instances: [ml.m5.large]
      transform_instances: [ml.m5.large]
    depends_on: [TrainIrisModel]
"#;

    #[test]
    fn test_parse_iris_pipeline() {
        let config = PipelineConfig::from_yaml(IRIS_YAML).unwrap();
        assert_eq!(config.name, "iris-mlflow-pipeline");
        assert_eq!(config.steps.len(), 3);

        let pipeline = config.to_pipeline().unwrap();
        assert_eq!(
            pipeline.execution_order(),
            &["PreprocessIrisData", "TrainIrisModel", "RegisterIrisModel"]
        );

        match &pipeline.step("PreprocessIrisData").unwrap().kind {
            StepKind::Processing(spec) => {
                assert_eq!(spec.image_uri, "registry.example.com/iris:latest");
                assert_eq!(spec.inputs[0].destination, PROCESSING_INPUT_PATH);
                assert_eq!(
                    spec.inputs[0].source,
                    InputSource::Uri("s3://example-bucket/iris-dataset/".to_string())
                );
                assert_eq!(spec.outputs[0].destination, "s3://example-bucket/iris-output/");
            }
            other => panic!("Expected processing step, got {:?}", other),
        }

        let train = pipeline.step("TrainIrisModel").unwrap();
        assert_eq!(
            train.hyperparameters().unwrap().get("max_leaf_nodes"),
            Some(&"30".to_string())
        );
    }

    #[test]
    fn test_mismatched_output_name_is_rejected() {
        let yaml = IRIS_YAML.replace("output: ProcessedData", "output: ProcessingOutput");
        let err = PipelineConfig::from_yaml(&yaml).unwrap_err();
        assert!(
            matches!(err, PipelineError::OutputNameMismatch { .. }),
            "Expected OutputNameMismatch, got {:?}",
            err
        );
    }

    #[test]
    fn test_output_name_is_required() {
        let yaml = IRIS_YAML.replace("      - output_name: ProcessedData\n", "      - ");
        assert!(PipelineConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_override_wins_over_yaml_variable() {
        let mut overrides = HashMap::new();
        overrides.insert("bucket".to_string(), "s3://other".to_string());

        let config = PipelineConfig::from_yaml_with_overrides(IRIS_YAML, &overrides).unwrap();
        let pipeline = config.to_pipeline().unwrap();
        match &pipeline.step("PreprocessIrisData").unwrap().kind {
            StepKind::Processing(spec) => {
                assert_eq!(spec.outputs[0].destination, "s3://other/iris-output/");
            }
            other => panic!("Expected processing step, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_variable_fails() {
        let yaml = IRIS_YAML.replace("{{ image }}", "{{ missing_image }}");
        let err = PipelineConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("missing_image"));
    }

    #[test]
    fn test_env_variable_required() {
        let yaml = r#"
name: "env-pipeline"
variables:
  bucket:
    env: ML_PIPELINE_TEST_UNSET_BUCKET_VAR
steps:
  - kind: processing
    name: Pre
    image_uri: image
    instance_type: ml.t3.medium
    outputs:
      - output_name: Out
        destination: "{{ bucket }}/out"
"#;
        let err = PipelineConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("ML_PIPELINE_TEST_UNSET_BUCKET_VAR"));
    }

    #[test]
    fn test_env_variable_optional_resolves_empty() {
        let yaml = r#"
name: "env-pipeline"
variables:
  tracking:
    env: ML_PIPELINE_TEST_UNSET_TRACKING_VAR
    required: false
steps:
  - kind: processing
    name: Pre
    image_uri: image
    instance_type: ml.t3.medium
    environment:
      MLFLOW_TRACKING_URI: "{{ tracking }}"
"#;
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        let vars = config.get_variables().unwrap();
        assert_eq!(
            vars.get("tracking"),
            Some(&VariableDefinition::Env {
                name: "ML_PIPELINE_TEST_UNSET_TRACKING_VAR".to_string(),
                required: false
            })
        );
    }

    #[test]
    fn test_model_step_requires_exactly_one_action() {
        let yaml = IRIS_YAML.replace(
            "    register:\n",
            "    deploy:\n      endpoint_name: iris\n      instance_type: ml.m5.large\n    register:\n",
        );
        let err = PipelineConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_duplicate_step_name_fails() {
        let yaml = r#"
name: "dup"
steps:
  - kind: processing
    name: Pre
    image_uri: image
    instance_type: ml.t3.medium
  - kind: processing
    name: Pre
    image_uri: image
    instance_type: ml.t3.medium
"#;
        assert!(PipelineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_dependency_fails() {
        let yaml = r#"
name: "dangling"
steps:
  - kind: processing
    name: Pre
    image_uri: image
    instance_type: ml.t3.medium
    depends_on: ["nonexistent"]
"#;
        assert!(PipelineConfig::from_yaml(yaml).is_err());
    }
}
