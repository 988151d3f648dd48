//! Tabular pass-through run by the processing step

use crate::core::{PROCESSING_INPUT_PATH, PROCESSING_OUTPUT_PATH};
use crate::error::{PipelineError, Result};
use crate::jobs::tabular::Table;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_INPUT_FILE: &str = "iris.csv";
pub const DEFAULT_OUTPUT_FILE: &str = "preprocessed_iris.csv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessConfig {
    pub input_dir: PathBuf,
    /// Created when missing
    pub output_dir: PathBuf,
    pub input_file: String,
    pub output_file: String,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(PROCESSING_INPUT_PATH),
            output_dir: PathBuf::from(PROCESSING_OUTPUT_PATH),
            input_file: DEFAULT_INPUT_FILE.to_string(),
            output_file: DEFAULT_OUTPUT_FILE.to_string(),
        }
    }
}

impl PreprocessConfig {
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_input_file(mut self, name: impl Into<String>) -> Self {
        self.input_file = name.into();
        self
    }

    pub fn with_output_file(mut self, name: impl Into<String>) -> Self {
        self.output_file = name.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreprocessReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub rows: usize,
    pub columns: usize,
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Copy the input file byte for byte to the output directory under the
/// output name; the parsed table only feeds the report
pub fn run(config: &PreprocessConfig) -> Result<PreprocessReport> {
    if is_empty_dir(&config.input_dir)? {
        return Err(PipelineError::NoInputFiles(config.input_dir.clone()));
    }

    let input = config.input_dir.join(&config.input_file);
    if !input.is_file() {
        return Err(PipelineError::InvalidData(format!(
            "Expected input file {} is missing",
            input.display()
        )));
    }

    std::fs::create_dir_all(&config.output_dir)?;
    let output = config.output_dir.join(&config.output_file);

    info!("Loading data from: {}", input.display());
    let bytes = std::fs::read(&input)?;
    let table = Table::from_reader(bytes.as_slice(), &input)?;

    info!("Saving processed data to: {}", output.display());
    std::fs::write(&output, &bytes)?;

    let report = PreprocessReport {
        input,
        output,
        rows: table.len(),
        columns: table.width(),
    };
    info!("Processing complete: {} rows, {} columns", report.rows, report.columns);
    Ok(report)
}
