//! Submitting pipelines and following their executions

use crate::backend::{OrchestrationBackend, UpsertOutcome};
use crate::core::{Execution, ExecutionDescription, ExecutionStatus, Pipeline, StepStatus};
use crate::error::{PipelineError, Result};
use crate::execution::RetryPolicy;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Events emitted while submitting and following a pipeline
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineUpserted {
        pipeline_name: String,
        outcome: UpsertOutcome,
    },
    ExecutionStarted {
        execution: Execution,
    },
    StatusChanged {
        execution_id: String,
        status: ExecutionStatus,
        progress: f64,
    },
    StepStatusChanged {
        execution_id: String,
        step_name: String,
        status: StepStatus,
    },
    ExecutionFinished {
        execution_id: String,
        status: ExecutionStatus,
        failure_reason: Option<String>,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        delay: Duration,
        error: String,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// How to wait for an execution to finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    /// `None` waits for as long as the execution runs
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

impl WaitOptions {
    pub fn unbounded() -> Self {
        Self {
            timeout: None,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Submits pipelines to a backend and follows their executions
pub struct PipelineSession<B> {
    backend: B,
    role_arn: String,
    retry: RetryPolicy,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl<B: OrchestrationBackend> PipelineSession<B> {
    /// `role_arn` is the execution role for steps that don't set their own
    pub fn new(backend: B, role_arn: impl Into<String>) -> Self {
        Self {
            backend,
            role_arn: role_arn.into(),
            retry: RetryPolicy::default(),
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Run an idempotent backend call, retrying transient failures
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => match self.retry.next_delay(attempt, &err) {
                    Some(delay) => {
                        warn!(
                            "{} failed (attempt {}/{}): {}; retrying in {:?}",
                            operation, attempt, self.retry.max_attempts, err, delay
                        );
                        self.emit_event(ExecutionEvent::RetryScheduled {
                            operation: operation.to_string(),
                            attempt,
                            delay,
                            error: err.to_string(),
                        })
                        .await;
                        sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    /// Create the pipeline or replace its definition under the same name
    pub async fn upsert(&self, pipeline: &Pipeline) -> Result<UpsertOutcome> {
        let definition = pipeline.definition(&self.role_arn);
        debug!("Upserting '{}': {}", pipeline.name, definition.canonical());

        let outcome = self
            .with_retry("upsert", || {
                self.backend
                    .upsert_pipeline(&pipeline.name, &definition, &self.role_arn)
            })
            .await?;

        info!(
            "Pipeline '{}' {} (version {})",
            pipeline.name,
            if outcome.created { "created" } else { "updated" },
            outcome.version
        );
        self.emit_event(ExecutionEvent::PipelineUpserted {
            pipeline_name: pipeline.name.clone(),
            outcome: outcome.clone(),
        })
        .await;

        Ok(outcome)
    }

    /// Start an execution of the most recently upserted definition.
    ///
    /// Returns as soon as the backend accepts it. Not retried: a repeated
    /// start would launch a second execution.
    pub async fn start(&self, pipeline: &Pipeline) -> Result<Execution> {
        let execution = self.backend.start_execution(&pipeline.name).await?;
        info!(
            "Started execution {} of '{}'",
            execution.execution_id, pipeline.name
        );
        self.emit_event(ExecutionEvent::ExecutionStarted {
            execution: execution.clone(),
        })
        .await;
        Ok(execution)
    }

    pub async fn describe(&self, execution_id: &str) -> Result<ExecutionDescription> {
        self.with_retry("describe", || self.backend.describe_execution(execution_id))
            .await
    }

    /// Poll until the execution reaches a terminal status.
    ///
    /// A terminal status other than `Succeeded` is still returned as `Ok`;
    /// exceeding `options.timeout` is a `Timeout` error.
    pub async fn wait(
        &self,
        execution: &Execution,
        options: &WaitOptions,
    ) -> Result<ExecutionDescription> {
        let started = Instant::now();
        let mut last_status: Option<ExecutionStatus> = None;
        let mut step_statuses: HashMap<String, StepStatus> = HashMap::new();

        loop {
            let description = self.describe(&execution.execution_id).await?;

            for step in &description.steps {
                if step_statuses.insert(step.step_name.clone(), step.step_status)
                    != Some(step.step_status)
                {
                    debug!("Step '{}' is {:?}", step.step_name, step.step_status);
                    self.emit_event(ExecutionEvent::StepStatusChanged {
                        execution_id: execution.execution_id.clone(),
                        step_name: step.step_name.clone(),
                        status: step.step_status,
                    })
                    .await;
                }
            }

            if last_status != Some(description.status) {
                info!(
                    "Execution {} is {}",
                    execution.execution_id, description.status
                );
                last_status = Some(description.status);
                self.emit_event(ExecutionEvent::StatusChanged {
                    execution_id: execution.execution_id.clone(),
                    status: description.status,
                    progress: description.progress(),
                })
                .await;
            }

            if description.status.is_terminal() {
                self.emit_event(ExecutionEvent::ExecutionFinished {
                    execution_id: execution.execution_id.clone(),
                    status: description.status,
                    failure_reason: description.failure_reason.clone(),
                })
                .await;
                return Ok(description);
            }

            let delay = match options.timeout {
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Err(PipelineError::Timeout {
                            execution_id: execution.execution_id.clone(),
                            elapsed,
                        });
                    }
                    options.poll_interval.min(timeout - elapsed)
                }
                None => options.poll_interval,
            };
            sleep(delay).await;
        }
    }

    /// Upsert, start, then wait for the execution to finish
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        options: &WaitOptions,
    ) -> Result<(Execution, ExecutionDescription)> {
        self.upsert(pipeline).await?;
        let execution = self.start(pipeline).await?;
        let description = self.wait(&execution, options).await?;
        Ok((execution, description))
    }
}
