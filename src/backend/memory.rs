//! In-process orchestration backend
//!
//! Used by `--dry-run` and by tests. Definitions are validated the way a real
//! backend would (graph shape, references) and executions advance one step
//! each time they are described.

use crate::backend::{OrchestrationBackend, UpsertOutcome};
use crate::core::{
    Execution, ExecutionDescription, ExecutionStatus, OutputRef, PipelineDefinition,
    StepExecution, StepStatus,
};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

const MODEL_ARTIFACTS_KEY: &str = "ModelArtifacts";

/// One step as read back from a submitted definition
#[derive(Debug, Clone)]
struct DefinedStep {
    name: String,
    step_type: String,
    depends_on: Vec<String>,
    references: Vec<OutputRef>,
    arguments: Value,
}

impl DefinedStep {
    fn declared_outputs(&self) -> Vec<(String, Option<String>)> {
        self.arguments
            .pointer("/ProcessingOutputConfig/Outputs")
            .and_then(Value::as_array)
            .map(|outputs| {
                outputs
                    .iter()
                    .filter_map(|o| {
                        let name = o.get("OutputName")?.as_str()?.to_string();
                        let uri = o
                            .pointer("/S3Output/S3Uri")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        Some((name, uri))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn produces(&self, reference: &OutputRef) -> bool {
        match reference.output_name() {
            Some(name) => self.declared_outputs().iter().any(|(n, _)| n == name),
            None => self.step_type == "Training",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredPipeline {
    arn: String,
    canonical: String,
    definition: PipelineDefinition,
    role_arn: String,
    version: u64,
    /// Steps in execution order
    steps: Vec<DefinedStep>,
}

#[derive(Debug)]
struct ExecutionRecord {
    pipeline_name: String,
    steps: Vec<DefinedStep>,
    states: Vec<StepExecution>,
    status: ExecutionStatus,
    failure_reason: Option<String>,
    creation_time: DateTime<Utc>,
    last_modified_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BackendState {
    pipelines: HashMap<String, StoredPipeline>,
    executions: HashMap<String, ExecutionRecord>,
    /// Calls left to fail with `BackendUnavailable`
    unavailable_calls: u32,
    calls: u32,
}

impl BackendState {
    fn enter(&mut self, operation: &str) -> Result<()> {
        self.calls += 1;
        if self.unavailable_calls > 0 {
            self.unavailable_calls -= 1;
            debug!("Injected unavailability for {}", operation);
            return Err(PipelineError::BackendUnavailable(format!(
                "{} temporarily unavailable",
                operation
            )));
        }
        Ok(())
    }
}

/// Backend that keeps everything in memory
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: RwLock<BackendState>,
    /// Step name → failure reason
    failing_steps: HashMap<String, String>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every step with this name fail when it runs
    pub fn with_failing_step(mut self, step: impl Into<String>, reason: impl Into<String>) -> Self {
        self.failing_steps.insert(step.into(), reason.into());
        self
    }

    /// Fail the next `calls` requests with `BackendUnavailable`
    pub fn with_unavailable_calls(mut self, calls: u32) -> Self {
        self.state.get_mut().unavailable_calls = calls;
        self
    }

    pub async fn pipeline_count(&self) -> usize {
        self.state.read().await.pipelines.len()
    }

    pub async fn pipeline_version(&self, name: &str) -> Option<u64> {
        self.state.read().await.pipelines.get(name).map(|p| p.version)
    }

    pub async fn definition(&self, name: &str) -> Option<PipelineDefinition> {
        self.state
            .read()
            .await
            .pipelines
            .get(name)
            .map(|p| p.definition.clone())
    }

    pub async fn role_arn(&self, name: &str) -> Option<String> {
        self.state
            .read()
            .await
            .pipelines
            .get(name)
            .map(|p| p.role_arn.clone())
    }

    /// Total calls received through the backend trait, including failed ones
    pub async fn calls(&self) -> u32 {
        self.state.read().await.calls
    }
}

#[async_trait]
impl OrchestrationBackend for InMemoryBackend {
    async fn upsert_pipeline(
        &self,
        name: &str,
        definition: &PipelineDefinition,
        role_arn: &str,
    ) -> Result<UpsertOutcome> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.enter("upsert")?;

        let steps = parse_definition(definition)?;
        let canonical = definition.canonical();

        let outcome = match state.pipelines.get_mut(name) {
            Some(existing) if existing.canonical == canonical && existing.role_arn == role_arn => {
                debug!("Definition of '{}' unchanged at version {}", name, existing.version);
                UpsertOutcome {
                    pipeline_arn: existing.arn.clone(),
                    created: false,
                    version: existing.version,
                }
            }
            Some(existing) => {
                existing.version += 1;
                existing.canonical = canonical;
                existing.definition = definition.clone();
                existing.role_arn = role_arn.to_string();
                existing.steps = steps;
                info!("Updated pipeline '{}' to version {}", name, existing.version);
                UpsertOutcome {
                    pipeline_arn: existing.arn.clone(),
                    created: false,
                    version: existing.version,
                }
            }
            None => {
                let arn = format!("arn:memory:pipeline/{}", name);
                state.pipelines.insert(
                    name.to_string(),
                    StoredPipeline {
                        arn: arn.clone(),
                        canonical,
                        definition: definition.clone(),
                        role_arn: role_arn.to_string(),
                        version: 1,
                        steps,
                    },
                );
                info!("Created pipeline '{}'", name);
                UpsertOutcome {
                    pipeline_arn: arn,
                    created: true,
                    version: 1,
                }
            }
        };

        Ok(outcome)
    }

    async fn start_execution(&self, pipeline_name: &str) -> Result<Execution> {
        let mut state = self.state.write().await;
        state.enter("start")?;

        let steps = state
            .pipelines
            .get(pipeline_name)
            .map(|p| p.steps.clone())
            .ok_or_else(|| {
                PipelineError::invalid(format!("Pipeline '{}' has not been upserted", pipeline_name))
            })?;

        let execution_id = format!(
            "arn:memory:pipeline/{}/execution/{}",
            pipeline_name,
            Uuid::new_v4().simple()
        );
        let now = Utc::now();
        let states = steps
            .iter()
            .map(|s| StepExecution {
                step_name: s.name.clone(),
                step_status: StepStatus::Pending,
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
                failure_reason: None,
            })
            .collect();

        state.executions.insert(
            execution_id.clone(),
            ExecutionRecord {
                pipeline_name: pipeline_name.to_string(),
                steps,
                states,
                status: ExecutionStatus::Pending,
                failure_reason: None,
                creation_time: now,
                last_modified_time: now,
            },
        );
        info!("Started execution {}", execution_id);

        Ok(Execution {
            execution_id,
            pipeline_name: pipeline_name.to_string(),
            started_at: now,
        })
    }

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription> {
        let mut state = self.state.write().await;
        state.enter("describe")?;

        let record = state
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| PipelineError::ExecutionNotFound(execution_id.to_string()))?;

        advance(record, execution_id, &self.failing_steps);

        Ok(ExecutionDescription {
            execution_id: execution_id.to_string(),
            pipeline_name: record.pipeline_name.clone(),
            status: record.status,
            failure_reason: record.failure_reason.clone(),
            creation_time: record.creation_time,
            last_modified_time: record.last_modified_time,
            steps: record.states.clone(),
        })
    }
}

/// Move an execution forward by one step
fn advance(record: &mut ExecutionRecord, execution_id: &str, failing: &HashMap<String, String>) {
    if record.status.is_terminal() {
        return;
    }
    record.last_modified_time = Utc::now();

    let running = record
        .states
        .iter()
        .position(|s| s.step_status == StepStatus::Executing);

    let next = match running {
        None => {
            record.status = ExecutionStatus::Executing;
            0
        }
        Some(index) => {
            let step_name = record.steps[index].name.clone();
            if let Some(reason) = failing.get(&step_name) {
                record.states[index].step_status = StepStatus::Failed;
                record.states[index].failure_reason = Some(reason.clone());
                for later in record.states.iter_mut().skip(index + 1) {
                    later.step_status = StepStatus::Skipped;
                }
                record.status = ExecutionStatus::Failed;
                record.failure_reason = Some(format!("Step '{}' failed: {}", step_name, reason));
                info!("Execution {} failed at step '{}'", execution_id, step_name);
                return;
            }

            let outputs = step_outputs(&record.steps[index], &record.pipeline_name, execution_id);
            record.states[index].outputs = outputs;
            record.states[index].step_status = StepStatus::Succeeded;
            index + 1
        }
    };

    if next >= record.steps.len() {
        record.status = ExecutionStatus::Succeeded;
        info!("Execution {} succeeded", execution_id);
        return;
    }

    let inputs = resolve_inputs(&record.steps[next], &record.states);
    record.states[next].inputs = inputs;
    record.states[next].step_status = StepStatus::Executing;
}

/// Concrete values for each symbolic reference, from upstream outputs
fn resolve_inputs(step: &DefinedStep, states: &[StepExecution]) -> BTreeMap<String, String> {
    step.references
        .iter()
        .filter_map(|reference| {
            let upstream = states.iter().find(|s| s.step_name == reference.step())?;
            let key = reference.output_name().unwrap_or(MODEL_ARTIFACTS_KEY);
            let value = upstream.outputs.get(key)?;
            Some((reference.path(), value.clone()))
        })
        .collect()
}

fn step_outputs(step: &DefinedStep, pipeline: &str, execution_id: &str) -> BTreeMap<String, String> {
    let run = execution_id.rsplit('/').next().unwrap_or(execution_id);
    let mut outputs = BTreeMap::new();

    match step.step_type.as_str() {
        "Processing" => {
            for (name, uri) in step.declared_outputs() {
                let uri = uri.unwrap_or_else(|| format!("memory://{}/{}/{}/{}", pipeline, run, step.name, name));
                outputs.insert(name, uri);
            }
        }
        "Training" => {
            let base = step
                .arguments
                .pointer("/OutputDataConfig/S3OutputPath")
                .and_then(Value::as_str)
                .map(|p| p.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("memory://{}", pipeline));
            outputs.insert(
                MODEL_ARTIFACTS_KEY.to_string(),
                format!("{}/{}-{}/output/model.tar.gz", base, step.name, run),
            );
        }
        "RegisterModel" => {
            let group = step
                .arguments
                .get("ModelPackageGroupName")
                .and_then(Value::as_str)
                .unwrap_or(step.name.as_str());
            outputs.insert(
                "ModelPackageArn".to_string(),
                format!("arn:memory:model-package/{}/{}", group, run),
            );
        }
        "Deploy" => {
            if let Some(endpoint) = step.arguments.get("EndpointName").and_then(Value::as_str) {
                outputs.insert("EndpointName".to_string(), endpoint.to_string());
            }
        }
        _ => {}
    }

    outputs
}

fn collect_references(value: &Value, out: &mut Vec<OutputRef>) {
    if let Some(reference) = OutputRef::from_json(value) {
        out.push(reference);
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

/// Read steps back from a definition and check the graph; returns steps in execution order
fn parse_definition(definition: &PipelineDefinition) -> Result<Vec<DefinedStep>> {
    let mut steps = Vec::new();
    for entry in definition.steps() {
        let name = entry
            .get("Name")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::invalid("Step without a Name"))?
            .to_string();
        let step_type = entry
            .get("Type")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::invalid(format!("Step '{}' has no Type", name)))?
            .to_string();
        let depends_on = entry
            .get("DependsOn")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let arguments = entry.get("Arguments").cloned().unwrap_or(Value::Null);
        let mut references = Vec::new();
        collect_references(&arguments, &mut references);

        steps.push(DefinedStep {
            name,
            step_type,
            depends_on,
            references,
            arguments,
        });
    }

    if steps.is_empty() {
        return Err(PipelineError::invalid("Definition has no steps"));
    }

    let mut by_name: HashMap<&str, &DefinedStep> = HashMap::new();
    for step in &steps {
        if by_name.insert(step.name.as_str(), step).is_some() {
            return Err(PipelineError::invalid(format!("Duplicate step name: {}", step.name)));
        }
    }

    for step in &steps {
        for dep in &step.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(PipelineError::invalid(format!(
                    "Step '{}' depends on non-existent step '{}'",
                    step.name, dep
                )));
            }
        }
        for reference in &step.references {
            match by_name.get(reference.step()) {
                Some(source) if source.produces(reference) => {}
                Some(_) => {
                    return Err(PipelineError::invalid(format!(
                        "Step '{}' references {}, which step '{}' does not produce",
                        step.name,
                        reference.path(),
                        reference.step()
                    )))
                }
                None => {
                    return Err(PipelineError::invalid(format!(
                        "Step '{}' references non-existent step '{}'",
                        step.name,
                        reference.step()
                    )))
                }
            }
        }
    }

    let order = execution_order(&steps)?;
    let mut by_name: HashMap<String, DefinedStep> =
        steps.into_iter().map(|s| (s.name.clone(), s)).collect();
    Ok(order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect())
}

/// Kahn's algorithm, picking ready steps in declaration order
fn execution_order(steps: &[DefinedStep]) -> Result<Vec<String>> {
    let upstream: Vec<HashSet<&str>> = steps
        .iter()
        .map(|s| {
            s.depends_on
                .iter()
                .map(String::as_str)
                .chain(s.references.iter().map(OutputRef::step))
                .collect()
        })
        .collect();

    let mut done: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(steps.len());

    while order.len() < steps.len() {
        let ready = steps.iter().enumerate().find(|(i, s)| {
            !done.contains(s.name.as_str()) && upstream[*i].iter().all(|u| done.contains(u))
        });
        match ready {
            Some((_, step)) => {
                done.insert(step.name.as_str());
                order.push(step.name.clone());
            }
            None => {
                return Err(PipelineError::invalid(
                    "Cycle detected in dependency graph".to_string(),
                ))
            }
        }
    }

    Ok(order)
}
