//! CLI command definitions

use crate::core::{PROCESSING_INPUT_PATH, PROCESSING_OUTPUT_PATH};
use crate::deploy::DEFAULT_DEPLOY_INSTANCE_TYPE;
use crate::execution::WaitOptions;
use crate::jobs::preprocess::{DEFAULT_INPUT_FILE, DEFAULT_OUTPUT_FILE};
use crate::jobs::train::{
    DEFAULT_MAX_LEAF_NODES, DEFAULT_MODEL_DIR, DEFAULT_OUTPUT_DATA_DIR,
    DEFAULT_REGISTERED_MODEL_NAME, DEFAULT_TRAIN_DIR,
};
use crate::tracking::TrackingConfig;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Load and validate a pipeline file
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Print the definition that would be submitted
    #[arg(long)]
    pub json: bool,
}

/// Create or update the pipeline definition without starting it
#[derive(Debug, Args, Clone)]
pub struct UpsertCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Use the in-process backend instead of a remote one
    #[arg(long)]
    pub dry_run: bool,
}

/// Polling behaviour while waiting on an execution
#[derive(Debug, Args, Clone)]
pub struct WaitArgs {
    /// Give up waiting after this many seconds (0 waits indefinitely)
    #[arg(long, default_value_t = 1800)]
    pub timeout_secs: u64,

    /// Seconds between status polls
    #[arg(long, default_value_t = 30)]
    pub poll_interval_secs: u64,
}

impl WaitArgs {
    pub fn options(&self) -> WaitOptions {
        let options = WaitOptions::unbounded()
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs.max(1)));
        if self.timeout_secs == 0 {
            options
        } else {
            options.with_timeout(Duration::from_secs(self.timeout_secs))
        }
    }
}

/// Upsert a pipeline, start an execution and follow it
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Return once the execution has started
    #[arg(long)]
    pub no_wait: bool,

    #[command(flatten)]
    pub wait: WaitArgs,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,

    /// Use the in-process backend instead of a remote one
    #[arg(long)]
    pub dry_run: bool,
}

/// Show the current state of an execution
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Execution ID returned by `run`
    pub execution_id: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Copy the input table to the output directory unchanged
#[derive(Debug, Args, Clone)]
pub struct PreprocessCommand {
    #[arg(long, default_value = PROCESSING_INPUT_PATH)]
    pub input_dir: PathBuf,

    #[arg(long, default_value = PROCESSING_OUTPUT_PATH)]
    pub output_dir: PathBuf,

    #[arg(long, default_value = DEFAULT_INPUT_FILE)]
    pub input_file: String,

    #[arg(long, default_value = DEFAULT_OUTPUT_FILE)]
    pub output_file: String,
}

/// Experiment tracker connection
#[derive(Debug, Args, Clone)]
pub struct TrackingArgs {
    /// Tracking server URL
    #[arg(long, env = "MLFLOW_TRACKING_URI")]
    pub tracking_uri: Option<String>,

    #[arg(long, env = "MLFLOW_TRACKING_TOKEN", hide_env_values = true)]
    pub tracking_token: Option<String>,

    #[arg(long, env = "MLFLOW_EXPERIMENT_ID")]
    pub experiment_id: Option<String>,
}

impl TrackingArgs {
    /// `None` when no tracking URI was given
    pub fn config(&self) -> crate::error::Result<Option<TrackingConfig>> {
        match self.tracking_uri.as_deref().filter(|u| !u.trim().is_empty()) {
            None => Ok(None),
            Some(uri) => Ok(Some(
                TrackingConfig::new(uri)?
                    .with_token(self.tracking_token.clone())
                    .with_experiment_id(self.experiment_id.clone()),
            )),
        }
    }
}

/// Fit the decision tree on the train channel
#[derive(Debug, Args, Clone)]
pub struct TrainCommand {
    /// Leaf budget of the tree
    #[arg(long = "max_leaf_nodes", alias = "max-leaf-nodes", default_value_t = DEFAULT_MAX_LEAF_NODES)]
    pub max_leaf_nodes: usize,

    #[arg(long, env = "SM_MODEL_DIR", default_value = DEFAULT_MODEL_DIR)]
    pub model_dir: PathBuf,

    /// Directory holding the training files
    #[arg(long, env = "SM_CHANNEL_TRAIN", default_value = DEFAULT_TRAIN_DIR)]
    pub train: PathBuf,

    #[arg(long, env = "SM_OUTPUT_DATA_DIR", default_value = DEFAULT_OUTPUT_DATA_DIR)]
    pub output_data_dir: PathBuf,

    /// Registry name the trained model is registered under
    #[arg(long, default_value = DEFAULT_REGISTERED_MODEL_NAME)]
    pub registered_model_name: String,

    #[command(flatten)]
    pub tracking: TrackingArgs,
}

/// Deploy the latest registered version of a model
#[derive(Debug, Args, Clone)]
pub struct DeployCommand {
    #[arg(long, default_value = DEFAULT_REGISTERED_MODEL_NAME)]
    pub model_name: String,

    #[arg(long)]
    pub endpoint_name: String,

    /// Serving container image
    #[arg(long)]
    pub image_uri: String,

    #[arg(long, default_value = DEFAULT_DEPLOY_INSTANCE_TYPE)]
    pub instance_type: String,

    #[arg(long, default_value_t = 1)]
    pub initial_instance_count: u32,

    #[command(flatten)]
    pub tracking: TrackingArgs,

    #[command(flatten)]
    pub wait: WaitArgs,

    /// Use the in-process backend instead of a remote one
    #[arg(long)]
    pub dry_run: bool,
}

/// Send one feature vector to a deployed endpoint
#[derive(Debug, Args, Clone)]
pub struct PredictCommand {
    #[arg(long)]
    pub endpoint: String,

    /// Comma-separated feature values, e.g. 4.0,8.0,6.0,3.0
    #[arg(long, required = true, value_delimiter = ',', allow_negative_numbers = true)]
    pub features: Vec<f64>,

    /// Inference service base URL
    #[arg(long, env = "INFERENCE_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "INFERENCE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
