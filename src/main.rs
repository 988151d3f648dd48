use anyhow::{Context, Result};
use ml_pipeline::backend::{BackendClientConfig, HttpBackend, InMemoryBackend, OrchestrationBackend};
use ml_pipeline::cli::commands::{
    DeployCommand, HistoryCommand, PredictCommand, PreprocessCommand, RunCommand,
    StatusCommand, TrainCommand, UpsertCommand, ValidateCommand,
};
use ml_pipeline::cli::output::*;
use ml_pipeline::cli::{Cli, Command};
use ml_pipeline::core::{ExecutionStatus, PipelineConfig, Settings};
use ml_pipeline::deploy::{deploy_latest, DeploySettings};
use ml_pipeline::execution::{ExecutionEvent, PipelineSession, WaitOptions};
use ml_pipeline::inference::InferenceClient;
use ml_pipeline::jobs::{preprocess, train, PreprocessConfig, TrainConfig};
use ml_pipeline::persistence::{
    summarize, ExecutionSummary, InMemoryPersistence, PersistenceBackend,
};
use ml_pipeline::tracking::MlflowClient;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type Session = PipelineSession<Arc<dyn OrchestrationBackend>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins when set
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let settings = Settings::new()
        .with_role_arn(cli.role_arn.clone())
        .with_region(cli.region.clone())
        .with_backend(
            cli.backend_url
                .clone()
                .map(|url| BackendClientConfig::new(url).with_token(cli.backend_token.clone())),
        );

    // Execute command
    let succeeded = match &cli.command {
        Command::Validate(cmd) => validate_pipeline(cmd, &cli)?,
        Command::Upsert(cmd) => upsert_pipeline(cmd, &cli, settings).await?,
        Command::Run(cmd) => run_pipeline(cmd, &cli, settings).await?,
        Command::Status(cmd) => show_status(cmd, settings).await?,
        Command::History(cmd) => show_history(cmd).await?,
        Command::Preprocess(cmd) => run_preprocess(cmd)?,
        Command::Train(cmd) => run_training(cmd, settings).await?,
        Command::Deploy(cmd) => deploy_model(cmd, settings).await?,
        Command::Predict(cmd) => predict(cmd, settings).await?,
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(file: &Path, cli: &Cli) -> Result<PipelineConfig> {
    let overrides = cli.variable_overrides();
    for (key, value) in &overrides {
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }
    PipelineConfig::from_file_with_overrides(file, &overrides)
        .with_context(|| format!("Failed to load pipeline config {}", file.display()))
}

fn open_backend(settings: &Settings, dry_run: bool) -> Result<Arc<dyn OrchestrationBackend>> {
    if dry_run {
        println!("{} Dry run: using the in-process backend", WARN);
        return Ok(Arc::new(InMemoryBackend::new()));
    }
    let config = settings.require_backend()?.clone();
    info!("Using orchestration backend at {}", config.base_url);
    Ok(Arc::new(HttpBackend::new(config)?))
}

fn session_for(settings: &Settings, role_arn: &str, dry_run: bool) -> Result<Session> {
    if let Some(region) = &settings.region {
        info!("Region: {}", region);
    }
    Ok(PipelineSession::new(open_backend(settings, dry_run)?, role_arn))
}

async fn open_history(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }
    #[cfg(feature = "sqlite")]
    {
        Ok(Arc::new(
            ml_pipeline::persistence::SqliteExecutionStore::with_default_path().await?,
        ))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        tracing::warn!("Built without the sqlite feature; history is not kept between runs");
        Ok(Arc::new(InMemoryPersistence::new()))
    }
}

fn validate_pipeline(cmd: &ValidateCommand, cli: &Cli) -> Result<bool> {
    println!("{} Validating pipeline...", INFO);

    match load_config(&cmd.file, cli).and_then(|c| Ok((c.to_pipeline()?, c))) {
        Ok((pipeline, config)) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&pipeline.name).bold());
            println!("  Steps: {}", style(pipeline.steps().len()).cyan());
            println!(
                "  Order: {}",
                style(pipeline.execution_order().join(" → ")).dim()
            );

            if cmd.json {
                let role = cli
                    .role_arn
                    .clone()
                    .or(config.role_arn.clone())
                    .unwrap_or_default();
                let definition = pipeline.definition(&role);
                println!("\n{}", serde_json::to_string_pretty(definition.as_value())?);
            }
            Ok(true)
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            Ok(false)
        }
    }
}

async fn upsert_pipeline(cmd: &UpsertCommand, cli: &Cli, settings: Settings) -> Result<bool> {
    let config = load_config(&cmd.file, cli)?;
    let settings = settings.with_pipeline_defaults(&config);
    let pipeline = config.to_pipeline()?;
    let session = session_for(&settings, settings.require_role()?, cmd.dry_run)?;

    let outcome = session.upsert(&pipeline).await?;
    println!(
        "{} {} {} (version {}, {})",
        CHECK,
        style(&pipeline.name).bold(),
        if outcome.created { "created" } else { "updated" },
        outcome.version,
        style(&outcome.pipeline_arn).dim()
    );
    Ok(true)
}

async fn run_pipeline(cmd: &RunCommand, cli: &Cli, settings: Settings) -> Result<bool> {
    let config = load_config(&cmd.file, cli)?;
    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let settings = settings.with_pipeline_defaults(&config);
    let pipeline = config.to_pipeline()?;
    let session = session_for(&settings, settings.require_role()?, cmd.dry_run)?;
    let store = open_history(cmd.no_history).await?;

    let spinner = create_spinner(format!("Submitting {}", pipeline.name));
    let events = spinner.clone();
    session
        .add_event_handler(move |event| {
            events.println(format_execution_event(&event));
            if let ExecutionEvent::StatusChanged { status, progress, .. } = &event {
                events.set_message(format!("{} ({:.0}%)", status, progress * 100.0));
            }
        })
        .await;

    session.upsert(&pipeline).await?;
    let execution = session.start(&pipeline).await?;
    let started = ExecutionSummary::started(&execution);
    store.save_execution(&started).await?;

    let observed = Arc::new(Mutex::new(started));
    let history = observed.clone();
    session
        .add_event_handler(move |event| {
            if let Ok(mut summary) = history.lock() {
                summary.observe(&event);
            }
        })
        .await;

    if cmd.no_wait {
        spinner.finish_and_clear();
        println!(
            "{} Execution started: {}",
            ROCKET,
            style(&execution.execution_id).cyan()
        );
        return Ok(true);
    }

    spinner.set_message(format!("Waiting on {}", short_id(&execution.execution_id)));
    let result = session.wait(&execution, &cmd.wait.options()).await;
    spinner.finish_and_clear();
    let description = match result {
        Ok(description) => description,
        Err(e) => {
            let last_seen = match observed.lock() {
                Ok(summary) => summary.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            if let Err(save_err) = store.save_execution(&last_seen).await {
                warn!("Failed to save execution {}: {}", execution.execution_id, save_err);
            }
            return Err(e.into());
        }
    };

    store.save_execution(&summarize(&execution, &description)).await?;
    if !cmd.no_history {
        println!(
            "{} Execution saved to history (ID: {})",
            INFO,
            style(short_id(&execution.execution_id)).dim()
        );
    }

    println!("\n{}", format_description(&description));
    let succeeded = description.status == ExecutionStatus::Succeeded;
    if succeeded {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&pipeline.name).bold(),
            style("successfully").green()
        );
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&pipeline.name).bold(),
            format_status(description.status)
        );
    }
    Ok(succeeded)
}

async fn show_status(cmd: &StatusCommand, settings: Settings) -> Result<bool> {
    let backend = open_backend(&settings, false)?;
    let session = PipelineSession::new(backend, settings.role_arn.clone().unwrap_or_default());
    let description = session.describe(&cmd.execution_id).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&description)?);
    } else {
        println!("{}", format_description(&description));
    }
    let status = description.status;
    Ok(!status.is_terminal() || status == ExecutionStatus::Succeeded)
}

async fn show_history(cmd: &HistoryCommand) -> Result<bool> {
    let store = open_history(false).await?;

    let mut executions = match &cmd.pipeline {
        Some(pipeline_name) => store.list_executions(pipeline_name).await?,
        None => store.list_recent(cmd.limit).await?,
    };
    executions.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(true);
    }

    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for summary in &executions {
        let duration = summary
            .completed_at
            .and_then(|done| done.signed_duration_since(summary.started_at).to_std().ok())
            .map(|d| format!(" - {}", format_duration(d)))
            .unwrap_or_default();
        println!("  {}{}", format_execution_summary(summary), style(duration).dim());
    }
    Ok(true)
}

fn run_preprocess(cmd: &PreprocessCommand) -> Result<bool> {
    let config = PreprocessConfig::new(&cmd.input_dir, &cmd.output_dir)
        .with_input_file(&cmd.input_file)
        .with_output_file(&cmd.output_file);
    let report = preprocess::run(&config)?;
    println!(
        "{} Wrote {} rows to {}",
        CHECK,
        report.rows,
        style(report.output.display()).cyan()
    );
    Ok(true)
}

async fn run_training(cmd: &TrainCommand, settings: Settings) -> Result<bool> {
    let config = TrainConfig::new(&cmd.train, &cmd.model_dir, &cmd.output_data_dir)
        .with_max_leaf_nodes(cmd.max_leaf_nodes)
        .with_registered_model_name(&cmd.registered_model_name);

    let settings = settings.with_tracking(cmd.tracking.config()?);
    let client = settings.tracking().cloned().map(MlflowClient::new).transpose()?;
    let experiment_id = settings
        .tracking()
        .map(|t| t.experiment_id.clone())
        .unwrap_or_default();

    let summary = train::run_tracked(&config, client.as_ref(), &experiment_id).await?;
    println!(
        "{} Trained on {} rows: accuracy {:.4}, {} leaves, depth {}",
        CHECK,
        summary.n_rows,
        summary.training_accuracy,
        summary.n_leaves,
        summary.depth
    );
    if let Some(version) = &summary.registered_version {
        println!(
            "{} Registered {} version {}",
            INFO,
            style(&cmd.registered_model_name).bold(),
            version
        );
    }
    Ok(true)
}

async fn deploy_model(cmd: &DeployCommand, settings: Settings) -> Result<bool> {
    let settings = settings.with_tracking(cmd.tracking.config()?);
    let tracking = settings.tracking().cloned().context(
        "Deployment needs a model registry; pass --tracking-uri or set MLFLOW_TRACKING_URI",
    )?;
    let registry = MlflowClient::new(tracking)?;
    let session = session_for(&settings, settings.require_role()?, cmd.dry_run)?;
    session
        .add_event_handler(|event| println!("{}", format_execution_event(&event)))
        .await;

    let deploy_settings = DeploySettings::new(&cmd.endpoint_name, &cmd.image_uri)
        .with_instance_type(&cmd.instance_type)
        .with_initial_instance_count(cmd.initial_instance_count);
    let wait: WaitOptions = cmd.wait.options();
    let outcome = deploy_latest(&registry, &session, &cmd.model_name, &deploy_settings, &wait).await?;

    let succeeded = outcome.description.status == ExecutionStatus::Succeeded;
    if succeeded {
        println!(
            "{} Deployed {} version {} to {}",
            CHECK,
            style(&cmd.model_name).bold(),
            outcome.version.version,
            style(&cmd.endpoint_name).cyan()
        );
    } else {
        println!("{}", format_description(&outcome.description));
    }
    Ok(succeeded)
}

async fn predict(cmd: &PredictCommand, settings: Settings) -> Result<bool> {
    let settings = settings.with_inference_base_url(cmd.base_url.clone());
    let client = InferenceClient::new(settings.require_inference_base_url()?, &cmd.endpoint)?
        .with_token(cmd.token.clone());

    let prediction = client.predict(&cmd.features).await?;
    info!("Prediction response: {}", prediction);
    match prediction.labels() {
        Some(labels) => println!("{} Prediction: {}", CHECK, style(labels.join(", ")).bold()),
        None => println!("{} Prediction: {}", CHECK, prediction),
    }
    Ok(true)
}
