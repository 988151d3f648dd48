//! In-process tracker and registry

use crate::error::{PipelineError, Result};
use crate::tracking::{
    latest_of, ExperimentTracker, ModelRegistry, ModelVersion, RunInfo, RunStatus,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedRun {
    pub experiment_id: String,
    pub run_name: Option<String>,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    /// Uploaded artifact paths with their contents
    pub artifacts: BTreeMap<String, Vec<u8>>,
    pub status: Option<&'static str>,
}

#[derive(Debug, Default)]
pub struct InMemoryTracker {
    runs: RwLock<HashMap<String, RecordedRun>>,
    models: RwLock<HashMap<String, Vec<ModelVersion>>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a registered version
    pub async fn insert_version(&self, name: &str, version: u64, source: &str) {
        self.models
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .push(ModelVersion {
                name: name.to_string(),
                version: version.to_string(),
                source: source.to_string(),
                run_id: None,
            });
    }

    pub async fn run(&self, run_id: &str) -> Option<RecordedRun> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn versions(&self, name: &str) -> Vec<ModelVersion> {
        self.models
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExperimentTracker for InMemoryTracker {
    async fn create_run(&self, experiment_id: &str, run_name: Option<&str>) -> Result<RunInfo> {
        let run_id = Uuid::new_v4().simple().to_string();
        self.runs.write().await.insert(
            run_id.clone(),
            RecordedRun {
                experiment_id: experiment_id.to_string(),
                run_name: run_name.map(str::to_string),
                ..RecordedRun::default()
            },
        );
        Ok(RunInfo {
            run_id,
            experiment_id: experiment_id.to_string(),
        })
    }

    async fn log_batch(
        &self,
        run_id: &str,
        params: &[(String, String)],
        metrics: &[(String, f64)],
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| PipelineError::Tracking(format!("Unknown run {}", run_id)))?;
        run.params.extend(params.iter().cloned());
        run.metrics.extend(metrics.iter().cloned());
        Ok(())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        local_file: &Path,
    ) -> Result<()> {
        let file_name = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PipelineError::Tracking(format!("{} has no file name", local_file.display()))
            })?;
        let contents = tokio::fs::read(local_file).await?;

        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| PipelineError::Tracking(format!("Unknown run {}", run_id)))?;
        let key = match artifact_path.trim_matches('/') {
            "" => file_name.to_string(),
            dir => format!("{}/{}", dir, file_name),
        };
        run.artifacts.insert(key, contents);
        Ok(())
    }

    async fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| PipelineError::Tracking(format!("Unknown run {}", run_id)))?;
        run.status = Some(status.as_str());
        Ok(())
    }
}

#[async_trait]
impl ModelRegistry for InMemoryTracker {
    async fn latest_version(&self, name: &str) -> Result<ModelVersion> {
        let models = self.models.read().await;
        models
            .get(name)
            .and_then(|versions| latest_of(versions.iter().cloned()))
            .ok_or_else(|| PipelineError::RegistryLookupFailure(name.to_string()))
    }

    async fn register_version(
        &self,
        name: &str,
        source: &str,
        run_id: Option<&str>,
    ) -> Result<ModelVersion> {
        let mut models = self.models.write().await;
        let versions = models.entry(name.to_string()).or_default();
        let next = versions.iter().filter_map(ModelVersion::number).max().unwrap_or(0) + 1;
        let version = ModelVersion {
            name: name.to_string(),
            version: next.to_string(),
            source: source.to_string(),
            run_id: run_id.map(str::to_string),
        };
        versions.push(version.clone());
        Ok(version)
    }
}
