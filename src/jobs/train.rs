//! Decision-tree training job run by the training step
//!
//! Reads every file in the train channel as headerless CSV (label in the
//! first column), fits a [`DecisionTreeClassifier`] and writes the model plus
//! a summary. With a tracker it also records the run and registers the model.

use crate::error::{PipelineError, Result};
use crate::jobs::tabular::Table;
use crate::model::DecisionTreeClassifier;
use crate::tracking::{
    run_model_uri, ExperimentTracker, ModelRegistry, ModelVersion, RunStatus, MODEL_ARTIFACT_PATH,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_TRAIN_DIR: &str = "/opt/ml/input/data/train";
pub const DEFAULT_MODEL_DIR: &str = "/opt/ml/model";
pub const DEFAULT_OUTPUT_DATA_DIR: &str = "/opt/ml/output/data";
pub const DEFAULT_MAX_LEAF_NODES: usize = 30;
pub const DEFAULT_REGISTERED_MODEL_NAME: &str = "sm-job-experiment-model";
pub const MODEL_FILE: &str = "model.json";
pub const SUMMARY_FILE: &str = "training_summary.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainConfig {
    pub train_dir: PathBuf,
    pub model_dir: PathBuf,
    pub output_data_dir: PathBuf,
    pub max_leaf_nodes: usize,
    pub registered_model_name: String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from(DEFAULT_TRAIN_DIR),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            output_data_dir: PathBuf::from(DEFAULT_OUTPUT_DATA_DIR),
            max_leaf_nodes: DEFAULT_MAX_LEAF_NODES,
            registered_model_name: DEFAULT_REGISTERED_MODEL_NAME.to_string(),
        }
    }
}

impl TrainConfig {
    pub fn new(
        train_dir: impl Into<PathBuf>,
        model_dir: impl Into<PathBuf>,
        output_data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            train_dir: train_dir.into(),
            model_dir: model_dir.into(),
            output_data_dir: output_data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_leaf_nodes(mut self, max_leaf_nodes: usize) -> Self {
        self.max_leaf_nodes = max_leaf_nodes;
        self
    }

    pub fn with_registered_model_name(mut self, name: impl Into<String>) -> Self {
        self.registered_model_name = name.into();
        self
    }
}

/// Written to the output data directory after a fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub max_leaf_nodes: usize,
    pub n_rows: usize,
    pub n_features: usize,
    pub classes: Vec<String>,
    pub n_leaves: usize,
    pub depth: usize,
    pub training_accuracy: f64,
    pub model_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_version: Option<String>,
}

impl TrainingSummary {
    fn params(&self) -> Vec<(String, String)> {
        vec![
            ("max_leaf_nodes".to_string(), self.max_leaf_nodes.to_string()),
            ("n_rows".to_string(), self.n_rows.to_string()),
            ("n_features".to_string(), self.n_features.to_string()),
        ]
    }

    fn metrics(&self) -> Vec<(String, f64)> {
        vec![
            ("training_accuracy".to_string(), self.training_accuracy),
            ("n_leaves".to_string(), self.n_leaves as f64),
            ("depth".to_string(), self.depth as f64),
        ]
    }
}

/// Regular files in `dir`, sorted by name
pub fn input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::NoInputFiles(dir.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(PipelineError::NoInputFiles(dir.to_path_buf()));
    }
    files.sort();
    Ok(files)
}

/// Feature matrix and labels from all files, rows concatenated in file order
pub fn load_dataset(files: &[PathBuf]) -> Result<(Array2<f64>, Vec<String>)> {
    let mut labels = Vec::new();
    let mut values = Vec::new();
    let mut n_features: Option<usize> = None;

    for file in files {
        let table = Table::read(file)?;
        for record in &table.records {
            let fields = &record.fields;
            if fields.len() < 2 {
                return Err(PipelineError::InvalidData(format!(
                    "{}:{}: record needs a label and at least one feature",
                    file.display(),
                    record.line
                )));
            }
            let width = fields.len() - 1;
            match n_features {
                None => n_features = Some(width),
                Some(expected) if expected != width => {
                    return Err(PipelineError::InvalidData(format!(
                        "{}:{}: record has {} features, expected {}",
                        file.display(),
                        record.line,
                        width,
                        expected
                    )))
                }
                Some(_) => {}
            }

            labels.push(fields[0].trim().to_string());
            for token in &fields[1..] {
                let value = token.trim().parse::<f64>().map_err(|_| {
                    PipelineError::InvalidData(format!(
                        "{}:{}: '{}' is not a number",
                        file.display(),
                        record.line,
                        token
                    ))
                })?;
                values.push(value);
            }
        }
    }

    let n_features = n_features.ok_or_else(|| {
        PipelineError::InvalidData("Training files contain no rows".to_string())
    })?;
    let x = Array2::from_shape_vec((labels.len(), n_features), values)
        .map_err(|e| PipelineError::InvalidData(e.to_string()))?;
    Ok((x, labels))
}

/// Fit and persist the model without tracking
pub fn run(config: &TrainConfig) -> Result<TrainingSummary> {
    if config.max_leaf_nodes < 2 {
        return Err(PipelineError::InvalidData(format!(
            "max_leaf_nodes must be at least 2, got {}",
            config.max_leaf_nodes
        )));
    }

    let files = input_files(&config.train_dir)?;
    info!("Reading {} training file(s) from {}", files.len(), config.train_dir.display());
    let (x, labels) = load_dataset(&files)?;

    let mut model = DecisionTreeClassifier::new().with_max_leaf_nodes(config.max_leaf_nodes);
    model.fit(&x, &labels)?;
    let training_accuracy = model.score(&x, &labels)?;

    std::fs::create_dir_all(&config.model_dir)?;
    let model_path = config.model_dir.join(MODEL_FILE);
    model.save(&model_path)?;
    info!("Model saved to {}", model_path.display());

    let summary = TrainingSummary {
        max_leaf_nodes: config.max_leaf_nodes,
        n_rows: labels.len(),
        n_features: model.n_features(),
        classes: model.classes().to_vec(),
        n_leaves: model.n_leaves(),
        depth: model.depth(),
        training_accuracy,
        model_path,
        run_id: None,
        registered_version: None,
    };
    write_summary(config, &summary)?;
    info!(
        "Training complete: accuracy {:.4}, {} leaves, depth {}",
        summary.training_accuracy, summary.n_leaves, summary.depth
    );
    Ok(summary)
}

fn write_summary(config: &TrainConfig, summary: &TrainingSummary) -> Result<()> {
    std::fs::create_dir_all(&config.output_data_dir)?;
    let path = config.output_data_dir.join(SUMMARY_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}

/// Fit, then record the run, upload the model and register it when a
/// tracker is given
pub async fn run_tracked<T>(
    config: &TrainConfig,
    tracker: Option<&T>,
    experiment_id: &str,
) -> Result<TrainingSummary>
where
    T: ExperimentTracker + ModelRegistry + ?Sized,
{
    let mut summary = run(config)?;
    let Some(tracker) = tracker else {
        warn!("No tracking server configured; skipping run tracking and model registration");
        return Ok(summary);
    };

    let run_info = tracker.create_run(experiment_id, Some("train")).await?;
    match record(tracker, config, &summary, &run_info.run_id).await {
        Ok(version) => {
            tracker.finish_run(&run_info.run_id, RunStatus::Finished).await?;
            info!(
                "Registered {} version {} from run {}",
                version.name, version.version, run_info.run_id
            );
            summary.run_id = Some(run_info.run_id);
            summary.registered_version = Some(version.version);
            write_summary(config, &summary)?;
            Ok(summary)
        }
        Err(e) => {
            if let Err(finish_err) = tracker.finish_run(&run_info.run_id, RunStatus::Failed).await {
                warn!("Failed to mark run {} as failed: {}", run_info.run_id, finish_err);
            }
            Err(e)
        }
    }
}

async fn record<T>(
    tracker: &T,
    config: &TrainConfig,
    summary: &TrainingSummary,
    run_id: &str,
) -> Result<ModelVersion>
where
    T: ExperimentTracker + ModelRegistry + ?Sized,
{
    tracker
        .log_batch(run_id, &summary.params(), &summary.metrics())
        .await?;
    tracker
        .log_artifact(run_id, MODEL_ARTIFACT_PATH, &summary.model_path)
        .await?;
    tracker
        .register_version(&config.registered_model_name, &run_model_uri(run_id), Some(run_id))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::InMemoryTracker;
    use tempfile::TempDir;

    const IRIS: &str = "\
setosa,5.1,3.5,1.4,0.2
setosa,4.9,3.0,1.4,0.2
setosa,4.7,3.2,1.3,0.2
versicolor,7.0,3.2,4.7,1.4
versicolor,6.4,3.2,4.5,1.5
versicolor,6.9,3.1,4.9,1.5
virginica,6.3,3.3,6.0,2.5
virginica,5.8,2.7,5.1,1.9
virginica,7.1,3.0,5.9,2.1
";

    fn workspace(files: &[(&str, &str)]) -> (TempDir, TrainConfig) {
        let root = TempDir::new().unwrap();
        let train = root.path().join("train");
        std::fs::create_dir_all(&train).unwrap();
        for (name, text) in files {
            std::fs::write(train.join(name), text).unwrap();
        }
        let config = TrainConfig::new(train, root.path().join("model"), root.path().join("output"));
        (root, config)
    }

    #[test]
    fn test_empty_train_dir_fails_before_fit() {
        let (_root, config) = workspace(&[]);
        let err = run(&config).unwrap_err();
        assert!(matches!(err, PipelineError::NoInputFiles(ref p) if p == &config.train_dir));
        assert!(!config.model_dir.join(MODEL_FILE).exists());
    }

    #[test]
    fn test_missing_train_dir_fails() {
        let root = TempDir::new().unwrap();
        let config = TrainConfig::new(root.path().join("absent"), root.path(), root.path());
        assert!(matches!(run(&config), Err(PipelineError::NoInputFiles(_))));
    }

    #[test]
    fn test_fit_writes_model_and_summary() {
        let (_root, config) = workspace(&[("iris.csv", IRIS)]);
        let summary = run(&config).unwrap();

        assert_eq!(summary.n_rows, 9);
        assert_eq!(summary.n_features, 4);
        assert_eq!(summary.classes, vec!["setosa", "versicolor", "virginica"]);
        assert_eq!(summary.training_accuracy, 1.0);

        let model = DecisionTreeClassifier::load(config.model_dir.join(MODEL_FILE)).unwrap();
        assert_eq!(model.predict_label(&[5.0, 3.4, 1.5, 0.2]).unwrap(), "setosa");

        let written: TrainingSummary = serde_json::from_str(
            &std::fs::read_to_string(config.output_data_dir.join(SUMMARY_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(written, summary);
    }

    #[test]
    fn test_files_are_concatenated_in_name_order() {
        let (head, tail) = IRIS.split_at(IRIS.find("versicolor").unwrap());
        let (_root, config) = workspace(&[("b.csv", tail), ("a.csv", head)]);
        let files = input_files(&config.train_dir).unwrap();
        let (_, labels) = load_dataset(&files).unwrap();

        assert_eq!(labels.first().map(String::as_str), Some("setosa"));
        assert_eq!(labels.last().map(String::as_str), Some("virginica"));
    }

    #[test]
    fn test_fixed_data_gives_identical_models() {
        let (_root, config) = workspace(&[("iris.csv", IRIS)]);
        run(&config).unwrap();
        let first = std::fs::read_to_string(config.model_dir.join(MODEL_FILE)).unwrap();
        run(&config).unwrap();
        let second = std::fs::read_to_string(config.model_dir.join(MODEL_FILE)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_non_numeric_feature_is_rejected() {
        let (_root, config) = workspace(&[("bad.csv", "setosa,5.1,abc\n")]);
        assert!(matches!(run(&config), Err(PipelineError::InvalidData(_))));
    }

    #[test]
    fn test_quoted_labels_and_padded_fields() {
        let text = "\"setosa\", 5.1 ,3.5\r\n\n\"virginica\",7.1,3.0\n";
        let (_root, config) = workspace(&[("iris.csv", text)]);
        let files = input_files(&config.train_dir).unwrap();
        let (x, labels) = load_dataset(&files).unwrap();

        assert_eq!(labels, vec!["setosa", "virginica"]);
        assert_eq!(x[[0, 0]], 5.1);
        assert_eq!(x.dim(), (2, 2));
    }

    #[test]
    fn test_inconsistent_width_names_the_line() {
        let (_root, config) = workspace(&[("iris.csv", "setosa,5.1,3.5\nsetosa,4.9\n")]);
        let err = run(&config).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidData(ref m) if m.contains(":2:")));
    }

    #[test]
    fn test_leaf_budget_below_two_is_rejected() {
        let (_root, config) = workspace(&[("iris.csv", IRIS)]);
        let config = config.with_max_leaf_nodes(1);
        assert!(matches!(run(&config), Err(PipelineError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_tracked_run_logs_and_registers() {
        let (_root, config) = workspace(&[("iris.csv", IRIS)]);
        let tracker = InMemoryTracker::new();

        let summary = run_tracked(&config, Some(&tracker), "0").await.unwrap();

        let run_id = summary.run_id.clone().unwrap();
        let recorded = tracker.run(&run_id).await.unwrap();
        assert_eq!(recorded.params["max_leaf_nodes"], "30");
        assert_eq!(recorded.params["n_rows"], "9");
        assert_eq!(recorded.metrics["training_accuracy"], 1.0);
        assert_eq!(recorded.status, Some("FINISHED"));
        let uploaded = &recorded.artifacts["model/model.json"];
        assert_eq!(uploaded, &std::fs::read(config.model_dir.join(MODEL_FILE)).unwrap());

        let latest = tracker
            .latest_version(DEFAULT_REGISTERED_MODEL_NAME)
            .await
            .unwrap();
        assert_eq!(latest.source, format!("runs:/{}/model", run_id));
        assert_eq!(summary.registered_version.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_untracked_run_still_trains() {
        let (_root, config) = workspace(&[("iris.csv", IRIS)]);
        let summary = run_tracked::<InMemoryTracker>(&config, None, "0").await.unwrap();
        assert!(summary.run_id.is_none());
        assert!(config.model_dir.join(MODEL_FILE).exists());
    }
}
