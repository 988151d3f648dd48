//! CLI output formatting

use crate::{
    core::{ExecutionDescription, ExecutionStatus, StepStatus},
    execution::ExecutionEvent,
    persistence::ExecutionSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Spinner shown while polling an execution
pub fn create_spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Last path segment of an execution ARN, which is enough to tell runs apart
pub fn short_id(execution_id: &str) -> &str {
    let tail = execution_id.rsplit('/').next().unwrap_or(execution_id);
    tail.get(..12).unwrap_or(tail)
}

pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Pending => style("PENDING").dim().to_string(),
        StepStatus::Executing => style("EXECUTING").yellow().to_string(),
        StepStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StepStatus::Failed => style("FAILED").red().to_string(),
        StepStatus::Skipped => style("SKIPPED").dim().to_string(),
    }
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Executing => style("EXECUTING").yellow().to_string(),
        ExecutionStatus::Stopping => style("STOPPING").yellow().to_string(),
        ExecutionStatus::Stopped => style("STOPPED").yellow().to_string(),
        ExecutionStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

fn status_icon(status: ExecutionStatus) -> Emoji<'static, 'static> {
    match status {
        ExecutionStatus::Succeeded => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Pending | ExecutionStatus::Executing => SPINNER,
        ExecutionStatus::Stopping | ExecutionStatus::Stopped => WARN,
    }
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    format!(
        "{} {} - {} - {} ({}/{}) - {}",
        status_icon(summary.status),
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.completed_steps,
        summary.total_steps,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    )
}

/// Multi-line view of a described execution
pub fn format_description(description: &ExecutionDescription) -> String {
    let mut lines = vec![
        format!(
            "{} {} ({})",
            status_icon(description.status),
            style(&description.pipeline_name).bold(),
            style(&description.execution_id).dim()
        ),
        format!("  Status: {}", format_status(description.status)),
        format!(
            "  Progress: {}",
            style(format!("{:.0}%", description.progress() * 100.0)).cyan()
        ),
    ];
    if let Some(reason) = &description.failure_reason {
        lines.push(format!("  Failure: {}", style(reason).red()));
    }
    for step in &description.steps {
        lines.push(format!(
            "  {} {}",
            style(&step.step_name).cyan(),
            format_step_status(step.step_status)
        ));
        for (name, value) in &step.outputs {
            lines.push(format!("      {} = {}", name, style(value).dim()));
        }
    }
    lines.join("\n")
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineUpserted {
            pipeline_name,
            outcome,
        } => format!(
            "{} Pipeline {} {} (version {})",
            INFO,
            style(pipeline_name).bold(),
            if outcome.created { "created" } else { "updated" },
            outcome.version
        ),
        ExecutionEvent::ExecutionStarted { execution } => format!(
            "{} Started {} ({})",
            ROCKET,
            style(&execution.pipeline_name).bold(),
            style(short_id(&execution.execution_id)).dim()
        ),
        ExecutionEvent::StatusChanged {
            status, progress, ..
        } => format!(
            "{} Execution {} ({:.0}%)",
            INFO,
            format_status(*status),
            progress * 100.0
        ),
        ExecutionEvent::StepStatusChanged {
            step_name, status, ..
        } => {
            let icon = match status {
                StepStatus::Succeeded => CHECK,
                StepStatus::Failed => CROSS,
                StepStatus::Skipped => WARN,
                StepStatus::Pending | StepStatus::Executing => SPINNER,
            };
            format!("{} {} {}", icon, style(step_name).cyan(), format_step_status(*status))
        }
        ExecutionEvent::ExecutionFinished {
            status,
            failure_reason,
            ..
        } => match failure_reason {
            Some(reason) => format!(
                "{} Execution {}: {}",
                status_icon(*status),
                format_status(*status),
                style(reason).dim()
            ),
            None => format!("{} Execution {}", status_icon(*status), format_status(*status)),
        },
        ExecutionEvent::RetryScheduled {
            operation,
            attempt,
            delay,
            error,
        } => format!(
            "{} {} failed (attempt {}), retrying in {}: {}",
            WARN,
            style(operation).yellow(),
            attempt,
            format_duration(*delay),
            style(error).dim()
        ),
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
