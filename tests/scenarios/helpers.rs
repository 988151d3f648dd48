//! Test utility functions for ml-pipeline

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use ml_pipeline::backend::{OrchestrationBackend, UpsertOutcome};
use ml_pipeline::core::{
    Execution, ExecutionDescription, ExecutionStatus, Pipeline, PipelineDefinition,
    ProcessingStep, ResourceSpec, StepExecution, StepStatus, TrainingStep,
};
use ml_pipeline::execution::{RetryPolicy, WaitOptions};
use ml_pipeline::{PipelineError, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const IRIS_YAML: &str = r#"
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
        destination: "{{ bucket }}/iris-output/"

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

/// Label-first rows as the training job reads them
pub const IRIS_TRAIN: &str = "\
setosa,5.1,3.5,1.4,0.2
setosa,4.9,3.0,1.4,0.2
setosa,4.7,3.2,1.3,0.2
setosa,5.0,3.6,1.4,0.2
versicolor,7.0,3.2,4.7,1.4
versicolor,6.4,3.2,4.5,1.5
versicolor,6.9,3.1,4.9,1.5
versicolor,5.5,2.3,4.0,1.3
virginica,6.3,3.3,6.0,2.5
virginica,5.8,2.7,5.1,1.9
virginica,7.1,3.0,5.9,2.1
virginica,6.5,3.0,5.8,2.2
";

pub fn two_step_pipeline() -> Pipeline {
    let pre = ProcessingStep::new("PreprocessIrisData", "image", ResourceSpec::new("ml.t3.medium"))
        .input("s3://bucket/iris-dataset/", "/opt/ml/processing/input")
        .output("ProcessedData", "/opt/ml/processing/output", "s3://bucket/iris-output/")
        .build()
        .unwrap();
    let train = TrainingStep::new("TrainIrisModel", "image", ResourceSpec::new("ml.c4.xlarge"))
        .hyperparameter("max_leaf_nodes", 30)
        .channel("train", pre.output("ProcessedData").unwrap())
        .depends_on("PreprocessIrisData")
        .build()
        .unwrap();
    Pipeline::new("iris-pipeline", vec![pre, train]).unwrap()
}

pub fn fast_wait() -> WaitOptions {
    WaitOptions::default()
        .with_poll_interval(Duration::from_millis(1))
        .with_timeout(Duration::from_secs(5))
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(4))
}

/// Backend that replays a fixed sequence of execution statuses.
///
/// The last scripted status repeats once the script runs out. The first
/// `upsert_failures` upserts and `describe_failures` describes fail with
/// `BackendUnavailable`.
pub struct ScriptedBackend {
    statuses: Mutex<VecDeque<ExecutionStatus>>,
    last: Mutex<ExecutionStatus>,
    upsert_failures: AtomicU32,
    describe_failures: AtomicU32,
    pub upserts: AtomicU32,
    pub starts: AtomicU32,
    pub describes: AtomicU32,
    pub definitions: Mutex<Vec<PipelineDefinition>>,
}

impl ScriptedBackend {
    pub fn new(statuses: &[ExecutionStatus]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            last: Mutex::new(ExecutionStatus::Executing),
            upsert_failures: AtomicU32::new(0),
            describe_failures: AtomicU32::new(0),
            upserts: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            describes: AtomicU32::new(0),
            definitions: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_upserts(self, count: u32) -> Self {
        self.upsert_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_describes(self, count: u32) -> Self {
        self.describe_failures.store(count, Ordering::SeqCst);
        self
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_status(&self) -> ExecutionStatus {
        let mut last = self.last.lock().unwrap();
        if let Some(status) = self.statuses.lock().unwrap().pop_front() {
            *last = status;
        }
        *last
    }
}

#[async_trait]
impl OrchestrationBackend for ScriptedBackend {
    async fn upsert_pipeline(
        &self,
        name: &str,
        definition: &PipelineDefinition,
        _role_arn: &str,
    ) -> Result<UpsertOutcome> {
        let calls = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        if Self::take_failure(&self.upsert_failures) {
            return Err(PipelineError::BackendUnavailable(format!(
                "503 on upsert attempt {}",
                calls
            )));
        }
        let mut definitions = self.definitions.lock().unwrap();
        definitions.push(definition.clone());
        Ok(UpsertOutcome {
            pipeline_arn: format!("arn:scripted:pipeline/{}", name),
            created: definitions.len() == 1,
            version: 1,
        })
    }

    async fn start_execution(&self, pipeline_name: &str) -> Result<Execution> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Execution {
            execution_id: format!("arn:scripted:pipeline/{}/execution/0001", pipeline_name),
            pipeline_name: pipeline_name.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.describe_failures) {
            return Err(PipelineError::BackendUnavailable("connection reset".to_string()));
        }
        let status = self.next_status();
        let step_status = match status {
            ExecutionStatus::Pending => StepStatus::Pending,
            ExecutionStatus::Succeeded => StepStatus::Succeeded,
            ExecutionStatus::Failed => StepStatus::Failed,
            _ => StepStatus::Executing,
        };
        Ok(ExecutionDescription {
            execution_id: execution_id.to_string(),
            pipeline_name: "iris-pipeline".to_string(),
            status,
            failure_reason: (status == ExecutionStatus::Failed)
                .then(|| "ClientError: training job failed".to_string()),
            creation_time: Utc::now(),
            last_modified_time: Utc::now(),
            steps: vec![StepExecution {
                step_name: "TrainIrisModel".to_string(),
                step_status,
                inputs: BTreeMap::new(),
                outputs: BTreeMap::new(),
                failure_reason: None,
            }],
        })
    }
}
