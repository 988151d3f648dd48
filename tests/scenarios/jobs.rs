//! Test: the jobs pipeline steps run, and the train, deploy, predict flow

use crate::helpers::*;
use ml_pipeline::core::ExecutionStatus;
use ml_pipeline::deploy::{deploy_latest, DeploySettings};
use ml_pipeline::execution::PipelineSession;
use ml_pipeline::inference::InferenceClient;
use ml_pipeline::jobs::train::{self, MODEL_FILE, SUMMARY_FILE};
use ml_pipeline::jobs::{preprocess, PreprocessConfig, TrainConfig};
use ml_pipeline::tracking::{InMemoryTracker, MlflowClient, TrackingConfig};
use ml_pipeline::{DecisionTreeClassifier, InMemoryBackend, PipelineError};
use mockito::{Matcher, Server};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn train_config(root: &Path) -> TrainConfig {
    let train_dir = root.join("input/data/train");
    std::fs::create_dir_all(&train_dir).unwrap();
    TrainConfig::new(train_dir, root.join("model"), root.join("output/data"))
}

#[test]
fn test_preprocess_is_an_identity_copy() {
    let root = TempDir::new().unwrap();
    let input = root.path().join("processing/input");
    let output = root.path().join("processing/output");
    std::fs::create_dir_all(&input).unwrap();
    let text = "5.1,3.5,1.4,0.2,setosa\n7.0,3.2,4.7,1.4,versicolor\n";
    std::fs::write(input.join("iris.csv"), text).unwrap();

    let report = preprocess::run(&PreprocessConfig::new(&input, &output)).unwrap();

    assert_eq!(report.output, output.join("preprocessed_iris.csv"));
    assert_eq!(report.rows, 2);
    assert_eq!(report.columns, 5);
    assert_eq!(std::fs::read_to_string(&report.output).unwrap(), text);
}

#[test]
fn test_preprocess_without_input_files() {
    let root = TempDir::new().unwrap();
    let config = PreprocessConfig::new(root.path().join("empty"), root.path().join("out"));

    let err = preprocess::run(&config).unwrap_err();
    assert!(matches!(err, PipelineError::NoInputFiles(_)));
    assert!(!root.path().join("out").exists());
}

#[test]
fn test_training_without_input_files_writes_nothing() {
    let root = TempDir::new().unwrap();
    let config = train_config(root.path());

    let err = train::run(&config).unwrap_err();

    assert!(matches!(err, PipelineError::NoInputFiles(ref dir) if dir == &config.train_dir));
    assert!(!config.model_dir.join(MODEL_FILE).exists());
    assert!(!config.output_data_dir.join(SUMMARY_FILE).exists());
}

#[test]
fn test_training_is_deterministic_across_workspaces() {
    let models: Vec<String> = (0..2)
        .map(|_| {
            let root = TempDir::new().unwrap();
            let config = train_config(root.path()).with_max_leaf_nodes(30);
            std::fs::write(config.train_dir.join("iris.csv"), IRIS_TRAIN).unwrap();
            train::run(&config).unwrap();
            std::fs::read_to_string(config.model_dir.join(MODEL_FILE)).unwrap()
        })
        .collect();

    assert_eq!(models[0], models[1]);
}

#[test]
fn test_trained_model_reproduces_training_labels() {
    let root = TempDir::new().unwrap();
    let config = train_config(root.path());
    std::fs::write(config.train_dir.join("iris.csv"), IRIS_TRAIN).unwrap();

    let summary = train::run(&config).unwrap();
    assert_eq!(summary.n_rows, 12);
    assert_eq!(summary.training_accuracy, 1.0);
    assert!(summary.n_leaves <= 30);

    let model = DecisionTreeClassifier::load(&summary.model_path).unwrap();
    assert_eq!(model.predict_label(&[5.1, 3.5, 1.4, 0.2]).unwrap(), "setosa");
    assert_eq!(model.predict_label(&[6.4, 3.2, 4.5, 1.5]).unwrap(), "versicolor");
    assert_eq!(model.predict_label(&[7.1, 3.0, 5.9, 2.1]).unwrap(), "virginica");
}

/// Two tracked training runs, then the newer registration is deployed and
/// the endpoint is queried
#[tokio::test]
async fn test_train_register_deploy_predict() {
    let tracker = InMemoryTracker::new();
    let mut run_ids = Vec::new();
    for _ in 0..2 {
        let root = TempDir::new().unwrap();
        let config = train_config(root.path()).with_registered_model_name("iris-model");
        std::fs::write(config.train_dir.join("iris.csv"), IRIS_TRAIN).unwrap();
        let summary = train::run_tracked(&config, Some(&tracker), "0").await.unwrap();
        run_ids.push(summary.run_id.unwrap());
    }

    let backend = Arc::new(InMemoryBackend::new());
    let session = PipelineSession::new(backend.clone(), "arn:role");
    let outcome = deploy_latest(
        &tracker,
        &session,
        "iris-model",
        &DeploySettings::new("iris-endpoint", "serving:latest"),
        &fast_wait(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.version.version, "2");
    assert_eq!(outcome.version.source, format!("runs:/{}/model", run_ids[1]));
    assert_eq!(outcome.description.status, ExecutionStatus::Succeeded);
    assert_eq!(backend.pipeline_count().await, 1);

    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/endpoints/iris-endpoint/invocations")
        .match_body(Matcher::Json(json!([[4.0, 8.0, 6.0, 3.0]])))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"["virginica"]"#)
        .create_async()
        .await;

    let client = InferenceClient::new(server.url(), "iris-endpoint").unwrap();
    let prediction = client.predict(&[4.0, 8.0, 6.0, 3.0]).await.unwrap();

    assert_eq!(prediction.labels(), Some(vec!["virginica".to_string()]));
    mock.assert_async().await;
}

/// A tracked run against an MLflow server uploads the model before the
/// version pointing at it is created
#[tokio::test]
async fn test_tracked_training_uploads_model_before_registering() {
    let mut server = Server::new_async().await;
    let _create = server
        .mock("POST", "/api/2.0/mlflow/runs/create")
        .with_status(200)
        .with_body(r#"{"run":{"info":{"run_id":"r9","experiment_id":"0"}}}"#)
        .create_async()
        .await;
    let _log = server
        .mock("POST", "/api/2.0/mlflow/runs/log-batch")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let _get = server
        .mock("GET", "/api/2.0/mlflow/runs/get")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"run":{"info":{"artifact_uri":"mlflow-artifacts:/0/r9/artifacts"}}}"#)
        .create_async()
        .await;
    let upload = server
        .mock(
            "PUT",
            Matcher::Regex(r"^/api/2\.0/mlflow-artifacts/artifacts/0/r9/artifacts/model/model\.json$".to_string()),
        )
        .match_body(Matcher::Regex("\"classes\"".to_string()))
        .with_status(200)
        .with_body("{}")
        .expect_at_least(1)
        .create_async()
        .await;
    let _registered = server
        .mock("POST", "/api/2.0/mlflow/registered-models/create")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;
    let version = server
        .mock("POST", "/api/2.0/mlflow/model-versions/create")
        .match_body(Matcher::PartialJson(json!({"source": "runs:/r9/model"})))
        .with_status(200)
        .with_body(r#"{"model_version":{"name":"iris-model","version":"1","source":"runs:/r9/model"}}"#)
        .create_async()
        .await;
    let _update = server
        .mock("POST", "/api/2.0/mlflow/runs/update")
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let root = TempDir::new().unwrap();
    let config = train_config(root.path()).with_registered_model_name("iris-model");
    std::fs::write(config.train_dir.join("iris.csv"), IRIS_TRAIN).unwrap();
    let client = MlflowClient::new(TrackingConfig::new(server.url()).unwrap()).unwrap();

    let summary = train::run_tracked(&config, Some(&client), "0").await.unwrap();

    assert_eq!(summary.registered_version.as_deref(), Some("1"));
    upload.assert_async().await;
    version.assert_async().await;
}
