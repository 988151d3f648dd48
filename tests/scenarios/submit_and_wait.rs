//! Test: submitting pipelines and following executions to a terminal status

use crate::helpers::*;
use ml_pipeline::core::{ExecutionStatus, OutputRef, PipelineConfig, StepStatus};
use ml_pipeline::execution::{ExecutionEvent, PipelineSession, RetryPolicy, WaitOptions};
use ml_pipeline::{InMemoryBackend, PipelineError};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The YAML pipeline runs end to end and every downstream step sees the
/// concrete URI its upstream step produced
#[tokio::test]
async fn test_yaml_pipeline_runs_to_success() {
    let config = PipelineConfig::from_yaml(IRIS_YAML).unwrap();
    let pipeline = config.to_pipeline().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let session = PipelineSession::new(backend.clone(), config.role_arn.clone().unwrap());

    let (execution, description) = session.run(&pipeline, &fast_wait()).await.unwrap();

    assert_eq!(execution.pipeline_name, "iris-mlflow-pipeline");
    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(description.progress(), 1.0);
    assert!(description
        .steps
        .iter()
        .all(|s| s.step_status == StepStatus::Succeeded));

    let processed = OutputRef::processing_output("PreprocessIrisData", "ProcessedData");
    let train = description.step("TrainIrisModel").unwrap();
    assert_eq!(
        train.inputs.get(&processed.path()).map(String::as_str),
        Some("s3://example-bucket/iris-output/")
    );

    let artifacts = OutputRef::model_artifacts("TrainIrisModel");
    let register = description.step("RegisterIrisModel").unwrap();
    assert_eq!(
        register.inputs.get(&artifacts.path()),
        train.outputs.get("ModelArtifacts")
    );
    assert!(register.outputs.contains_key("ModelPackageArn"));
}

#[tokio::test]
async fn test_variable_override_reaches_the_backend() {
    let overrides: HashMap<String, String> = [("bucket".to_string(), "s3://other-bucket".to_string())]
        .into_iter()
        .collect();
    let config = PipelineConfig::from_yaml_with_overrides(IRIS_YAML, &overrides).unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let session = PipelineSession::new(backend.clone(), "arn:role");

    session.upsert(&config.to_pipeline().unwrap()).await.unwrap();

    let definition = backend.definition("iris-mlflow-pipeline").await.unwrap();
    assert!(definition.canonical().contains("s3://other-bucket/iris-output/"));
    assert!(!definition.canonical().contains("example-bucket"));
}

#[tokio::test]
async fn test_repeated_upsert_keeps_a_single_definition() {
    let backend = Arc::new(InMemoryBackend::new());
    let session = PipelineSession::new(backend.clone(), "arn:role");
    let pipeline = two_step_pipeline();

    let first = session.upsert(&pipeline).await.unwrap();
    let second = session.upsert(&pipeline).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(backend.pipeline_count().await, 1);
    assert_eq!(backend.pipeline_version("iris-pipeline").await, Some(first.version));
}

#[tokio::test]
async fn test_wait_follows_scripted_statuses() {
    let backend = Arc::new(ScriptedBackend::new(&[
        ExecutionStatus::Pending,
        ExecutionStatus::Executing,
        ExecutionStatus::Executing,
        ExecutionStatus::Succeeded,
    ]));
    let session = PipelineSession::new(backend.clone(), "arn:role");
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    session
        .add_event_handler(move |event| {
            if let ExecutionEvent::StatusChanged { status, .. } = event {
                sink.lock().unwrap().push(status);
            }
        })
        .await;

    let (_, description) = session.run(&two_step_pipeline(), &fast_wait()).await.unwrap();

    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(backend.describes.load(Ordering::SeqCst), 4);
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![
            ExecutionStatus::Pending,
            ExecutionStatus::Executing,
            ExecutionStatus::Succeeded
        ]
    );
}

#[tokio::test]
async fn test_failed_execution_is_not_an_error() {
    let backend = ScriptedBackend::new(&[ExecutionStatus::Executing, ExecutionStatus::Failed]);
    let session = PipelineSession::new(backend, "arn:role");

    let (_, description) = session.run(&two_step_pipeline(), &fast_wait()).await.unwrap();

    assert_eq!(description.status, ExecutionStatus::Failed);
    assert_eq!(
        description.failure_reason.as_deref(),
        Some("ClientError: training job failed")
    );
}

#[tokio::test]
async fn test_stopped_execution_ends_the_wait() {
    let backend = ScriptedBackend::new(&[ExecutionStatus::Stopping, ExecutionStatus::Stopped]);
    let session = PipelineSession::new(backend, "arn:role");

    let (_, description) = session.run(&two_step_pipeline(), &fast_wait()).await.unwrap();
    assert_eq!(description.status, ExecutionStatus::Stopped);
}

#[tokio::test]
async fn test_failing_step_skips_downstream_steps() {
    let backend = InMemoryBackend::new().with_failing_step("PreprocessIrisData", "exit code 1");
    let session = PipelineSession::new(backend, "arn:role");

    let (_, description) = session.run(&two_step_pipeline(), &fast_wait()).await.unwrap();

    assert_eq!(description.status, ExecutionStatus::Failed);
    assert_eq!(
        description.step("PreprocessIrisData").unwrap().step_status,
        StepStatus::Failed
    );
    assert_eq!(
        description.step("TrainIrisModel").unwrap().step_status,
        StepStatus::Skipped
    );
}

#[tokio::test]
async fn test_transient_upsert_failures_are_retried() {
    let backend = Arc::new(ScriptedBackend::new(&[ExecutionStatus::Succeeded]).failing_upserts(2));
    let session =
        PipelineSession::new(backend.clone(), "arn:role").with_retry_policy(quick_retry());
    let retries = Arc::new(Mutex::new(Vec::new()));
    let sink = retries.clone();
    session
        .add_event_handler(move |event| {
            if let ExecutionEvent::RetryScheduled {
                operation, attempt, ..
            } = event
            {
                sink.lock().unwrap().push((operation, attempt));
            }
        })
        .await;

    let (_, description) = session.run(&two_step_pipeline(), &fast_wait()).await.unwrap();

    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(backend.upserts.load(Ordering::SeqCst), 3);
    assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        *retries.lock().unwrap(),
        vec![("upsert".to_string(), 1), ("upsert".to_string(), 2)]
    );
}

#[tokio::test]
async fn test_transient_describe_failures_are_retried() {
    let backend = Arc::new(
        ScriptedBackend::new(&[ExecutionStatus::Executing, ExecutionStatus::Succeeded])
            .failing_describes(1),
    );
    let session =
        PipelineSession::new(backend.clone(), "arn:role").with_retry_policy(quick_retry());

    let (_, description) = session.run(&two_step_pipeline(), &fast_wait()).await.unwrap();

    assert_eq!(description.status, ExecutionStatus::Succeeded);
    assert_eq!(backend.describes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_retries_surface_backend_unavailable() {
    let backend = Arc::new(ScriptedBackend::new(&[]).failing_upserts(10));
    let session = PipelineSession::new(backend.clone(), "arn:role")
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1)));

    let err = session.upsert(&two_step_pipeline()).await.unwrap_err();

    assert!(matches!(err, PipelineError::BackendUnavailable(_)));
    assert_eq!(backend.upserts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unfinished_execution_times_out() {
    let backend = Arc::new(ScriptedBackend::new(&[ExecutionStatus::Executing]));
    let session = PipelineSession::new(backend.clone(), "arn:role");
    let options = WaitOptions::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_millis(40));

    let execution = {
        session.upsert(&two_step_pipeline()).await.unwrap();
        session.start(&two_step_pipeline()).await.unwrap()
    };
    let err = session.wait(&execution, &options).await.unwrap_err();

    match err {
        PipelineError::Timeout {
            execution_id,
            elapsed,
        } => {
            assert_eq!(execution_id, execution.execution_id);
            assert!(elapsed >= Duration::from_millis(40));
        }
        other => panic!("Expected Timeout, got {:?}", other),
    }
    assert!(backend.describes.load(Ordering::SeqCst) >= 2);
}
