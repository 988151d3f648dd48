//! JSON pipeline definition submitted to the orchestration backend

use crate::core::{
    pipeline::Pipeline,
    step::{InputSource, ModelAction, Step, StepKind},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Definition schema version understood by the backend
pub const DEFINITION_VERSION: &str = "2020-12-01";

/// Rendered pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineDefinition(Value);

impl PipelineDefinition {
    pub(crate) fn render(pipeline: &Pipeline, role_arn: &str) -> Self {
        let steps: Vec<Value> = pipeline
            .steps()
            .iter()
            .map(|step| render_step(step, role_arn))
            .collect();

        PipelineDefinition(json!({
            "Version": DEFINITION_VERSION,
            "Metadata": {},
            "Parameters": [],
            "PipelineExperimentConfig": {
                "ExperimentName": pipeline.name,
                "TrialName": { "Get": "Execution.PipelineExecutionId" }
            },
            "Steps": steps,
        }))
    }

    /// Wrap an already-rendered definition (e.g. one received by a backend)
    pub fn from_value(value: Value) -> Self {
        PipelineDefinition(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Canonical string form; equal definitions always produce equal strings
    pub fn canonical(&self) -> String {
        // serde_json maps are ordered by key, so serialization is stable
        self.0.to_string()
    }

    /// Step entries of the definition
    pub fn steps(&self) -> &[Value] {
        self.0
            .get("Steps")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn render_source(source: &InputSource) -> Value {
    match source {
        InputSource::Uri(uri) => Value::String(uri.clone()),
        InputSource::Step(reference) => reference.to_json(),
    }
}

fn render_environment(environment: &std::collections::BTreeMap<String, String>) -> Value {
    Value::Object(
        environment
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<_, _>>(),
    )
}

fn render_step(step: &Step, default_role: &str) -> Value {
    let (step_type, arguments) = match &step.kind {
        StepKind::Processing(spec) => {
            let mut entrypoint = spec.command.clone();
            let mut inputs: Vec<Value> = spec
                .inputs
                .iter()
                .enumerate()
                .map(|(i, input)| {
                    json!({
                        "InputName": format!("input-{}", i + 1),
                        "AppManaged": false,
                        "S3Input": {
                            "S3Uri": render_source(&input.source),
                            "LocalPath": input.destination,
                            "S3DataType": "S3Prefix",
                            "S3InputMode": "File",
                            "S3DataDistributionType": "FullyReplicated",
                        }
                    })
                })
                .collect();

            if let Some(code) = &spec.code {
                let file_name = code.rsplit('/').next().unwrap_or(code);
                let local_path = "/opt/ml/processing/input/code";
                inputs.push(json!({
                    "InputName": "code",
                    "AppManaged": false,
                    "S3Input": {
                        "S3Uri": code,
                        "LocalPath": local_path,
                        "S3DataType": "S3Prefix",
                        "S3InputMode": "File",
                        "S3DataDistributionType": "FullyReplicated",
                    }
                }));
                entrypoint.push(format!("{}/{}", local_path, file_name));
            }

            let outputs: Vec<Value> = spec
                .outputs
                .iter()
                .map(|output| {
                    json!({
                        "OutputName": output.output_name,
                        "AppManaged": false,
                        "S3Output": {
                            "S3Uri": output.destination,
                            "LocalPath": output.source,
                            "S3UploadMode": "EndOfJob",
                        }
                    })
                })
                .collect();

            (
                "Processing",
                json!({
                    "ProcessingResources": {
                        "ClusterConfig": {
                            "InstanceType": spec.resources.instance_type,
                            "InstanceCount": spec.resources.instance_count,
                            "VolumeSizeInGB": spec.resources.volume_size_gb,
                        }
                    },
                    "AppSpecification": {
                        "ImageUri": spec.image_uri,
                        "ContainerEntrypoint": entrypoint,
                    },
                    "RoleArn": spec.role_arn.as_deref().unwrap_or(default_role),
                    "ProcessingInputs": inputs,
                    "ProcessingOutputConfig": { "Outputs": outputs },
                    "Environment": render_environment(&spec.environment),
                }),
            )
        }
        StepKind::Training(spec) => {
            let mut hyperparameters: Map<String, Value> = spec
                .hyperparameters
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            if let Some(entry_point) = &spec.entry_point {
                hyperparameters.insert(
                    "sagemaker_program".to_string(),
                    Value::String(entry_point.clone()),
                );
            }
            if let Some(source_dir) = &spec.source_dir {
                hyperparameters.insert(
                    "sagemaker_submit_directory".to_string(),
                    Value::String(source_dir.clone()),
                );
            }

            let channels: Vec<Value> = spec
                .channels
                .iter()
                .map(|(name, source)| {
                    json!({
                        "ChannelName": name,
                        "DataSource": {
                            "S3DataSource": {
                                "S3DataType": "S3Prefix",
                                "S3Uri": render_source(source),
                                "S3DataDistributionType": "FullyReplicated",
                            }
                        }
                    })
                })
                .collect();

            let mut arguments = json!({
                "AlgorithmSpecification": {
                    "TrainingImage": spec.image_uri,
                    "TrainingInputMode": "File",
                },
                "ResourceConfig": {
                    "InstanceType": spec.resources.instance_type,
                    "InstanceCount": spec.resources.instance_count,
                    "VolumeSizeInGB": spec.resources.volume_size_gb,
                },
                "RoleArn": spec.role_arn.as_deref().unwrap_or(default_role),
                "StoppingCondition": { "MaxRuntimeInSeconds": spec.max_runtime_secs },
                "HyperParameters": hyperparameters,
                "InputDataConfig": channels,
                "Environment": render_environment(&spec.environment),
            });
            if let (Some(output_path), Some(map)) = (&spec.output_path, arguments.as_object_mut()) {
                map.insert(
                    "OutputDataConfig".to_string(),
                    json!({ "S3OutputPath": output_path }),
                );
            }

            ("Training", arguments)
        }
        StepKind::Model(spec) => {
            let container = json!({
                "Image": spec.image_uri,
                "ModelDataUrl": render_source(&spec.model_data),
            });
            let role = spec.role_arn.as_deref().unwrap_or(default_role);

            match &spec.action {
                ModelAction::Register(register) => (
                    "RegisterModel",
                    json!({
                        "ModelPackageGroupName": register.model_package_group,
                        "ModelApprovalStatus": register.approval_status,
                        "InferenceSpecification": {
                            "Containers": [container],
                            "SupportedContentTypes": register.content_types,
                            "SupportedResponseMIMETypes": register.response_types,
                            "SupportedRealtimeInferenceInstanceTypes": register.inference_instances,
                            "SupportedTransformInstanceTypes": register.transform_instances,
                        },
                        "RoleArn": role,
                    }),
                ),
                ModelAction::Deploy(deploy) => (
                    "Deploy",
                    json!({
                        "EndpointName": deploy.endpoint_name,
                        "PrimaryContainer": container,
                        "ProductionVariants": [{
                            "VariantName": "AllTraffic",
                            "InstanceType": deploy.instance_type,
                            "InitialInstanceCount": deploy.initial_instance_count,
                        }],
                        "RoleArn": role,
                    }),
                ),
            }
        }
    };

    let mut entry = json!({
        "Name": step.name,
        "Type": step_type,
        "Arguments": arguments,
    });
    if !step.depends_on.is_empty() {
        if let Some(map) = entry.as_object_mut() {
            map.insert("DependsOn".to_string(), json!(step.depends_on));
        }
    }
    entry
}
