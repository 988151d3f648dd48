//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    parse_key_value, DeployCommand, HistoryCommand, PredictCommand, PreprocessCommand,
    RunCommand, StatusCommand, TrainCommand, UpsertCommand, ValidateCommand,
};
use std::collections::HashMap;
use std::ffi::OsString;

/// Define, submit and monitor ML pipelines
#[derive(Debug, Parser, Clone)]
#[command(name = "ml-pipeline")]
#[command(version)]
#[command(about = "Define, submit and monitor ML training pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Execution role for pipeline steps
    #[arg(long, global = true, env = "PIPELINE_ROLE_ARN")]
    pub role_arn: Option<String>,

    #[arg(long, global = true, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Orchestration backend base URL
    #[arg(long, global = true, env = "PIPELINE_BACKEND_URL")]
    pub backend_url: Option<String>,

    #[arg(long, global = true, env = "PIPELINE_BACKEND_TOKEN", hide_env_values = true)]
    pub backend_token: Option<String>,

    /// Pipeline variable override (key=value), repeatable
    #[arg(long, global = true, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate a pipeline configuration
    Validate(ValidateCommand),

    /// Create or update a pipeline definition
    Upsert(UpsertCommand),

    /// Upsert, start and follow a pipeline execution
    Run(RunCommand),

    /// Show an execution's status
    Status(StatusCommand),

    /// Show execution history
    History(HistoryCommand),

    /// Run the tabular pass-through job
    Preprocess(PreprocessCommand),

    /// Run the decision-tree training job
    Train(TrainCommand),

    /// Deploy the latest registered model version
    Deploy(DeployCommand),

    /// Invoke a deployed endpoint
    Predict(PredictCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }

    /// `--variable` overrides; a later occurrence of a key wins
    pub fn variable_overrides(&self) -> HashMap<String, String> {
        self.variable.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "ml-pipeline",
            "run",
            "-f",
            "pipeline.yaml",
            "--variable",
            "bucket=my-bucket",
            "--variable",
            "bucket=other",
            "--dry-run",
            "--timeout-secs",
            "60",
        ])
        .unwrap();

        assert_eq!(cli.variable_overrides()["bucket"], "other");
        match cli.command {
            Command::Run(run) => {
                assert_eq!(run.file, PathBuf::from("pipeline.yaml"));
                assert!(run.dry_run);
                assert_eq!(
                    run.wait.options().timeout,
                    Some(std::time::Duration::from_secs(60))
                );
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_zero_timeout_waits_indefinitely() {
        let cli = Cli::try_parse_from(["ml-pipeline", "run", "-f", "p.yaml", "--timeout-secs", "0"])
            .unwrap();
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.wait.options().timeout, None);
    }

    #[test]
    fn test_predict_features() {
        let cli = Cli::try_parse_from([
            "ml-pipeline",
            "predict",
            "--endpoint",
            "iris",
            "--features",
            "4.0,8.0,6.0,3.0",
        ])
        .unwrap();
        let Command::Predict(predict) = cli.command else {
            panic!("expected predict");
        };
        assert_eq!(predict.features, vec![4.0, 8.0, 6.0, 3.0]);
    }

    #[test]
    fn test_train_accepts_underscore_flag() {
        let cli = Cli::try_parse_from([
            "ml-pipeline",
            "train",
            "--max_leaf_nodes",
            "12",
            "--train",
            "/data/train",
        ])
        .unwrap();
        let Command::Train(train) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(train.max_leaf_nodes, 12);
        assert_eq!(train.train, PathBuf::from("/data/train"));
    }

    #[test]
    fn test_malformed_variable_is_rejected() {
        assert!(Cli::try_parse_from([
            "ml-pipeline",
            "validate",
            "-f",
            "p.yaml",
            "--variable",
            "novalue"
        ])
        .is_err());
    }
}
