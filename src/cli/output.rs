//! CLI output formatting

use crate::{
    core::{ExecutionStatus, RunPhase},
    execution::{EventBus, ExecutionEvent},
    persistence::RunSummary,
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
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "# ");

/// Create a spinner for the step currently running
pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Print events as they happen, with a spinner on the running step.
///
/// Returns the spinner so the caller can clear it when the command ends.
pub fn attach_reporter(events: &EventBus) -> ProgressBar {
    let spinner = create_spinner();
    let handle = spinner.clone();
    events.subscribe(move |event| {
        if let ExecutionEvent::StepStarted { step_id, name, .. } = &event {
            handle.set_message(format!("{} {}", style(step_id).cyan(), style(name).dim()));
            return;
        }
        if let Some(line) = format_execution_event(&event) {
            handle.suspend(|| println!("{}", line));
        }
        if matches!(event, ExecutionEvent::StageCompleted { .. }) {
            handle.set_message("");
        }
    });
    spinner
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

/// Format a run phase for display
pub fn format_phase(phase: RunPhase) -> String {
    match phase {
        RunPhase::Deployed | RunPhase::BuildComplete => style(phase).green().to_string(),
        RunPhase::Failed => style(phase).red().to_string(),
        RunPhase::Queued => style(phase).yellow().to_string(),
        _ => style(phase).cyan().to_string(),
    }
}

/// Format a run summary for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Pending => INFO,
    };

    let mut line = format!(
        "{} {} - {} {} - {} - {}",
        status_icon,
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.pipeline_name).bold(),
        style(summary.workflow).cyan(),
        summary.trigger,
        format_status(summary.status),
    );
    if let Some(phase) = summary.phase {
        line.push_str(&format!(" ({})", format_phase(phase)));
    }
    if let Some(completed) = summary.completed_at {
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            line.push_str(&format!(" in {}", style(format_duration(duration)).dim()));
        }
    }
    if let Some(failure) = summary.failure {
        line.push_str(&format!(" [{}]", style(failure).red()));
    }
    line
}

/// Format an execution event for display; `None` for events with no line
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::RunQueued {
            run_id,
            trigger,
            position,
        } => format!(
            "{} Run {} for {} ({} ahead in the publish queue)",
            ROCKET,
            style(&run_id.to_string()[..8]).dim(),
            style(trigger).bold(),
            position
        ),
        ExecutionEvent::StageStarted { stage, steps, .. } => {
            format!("{} {} stage ({} steps)", INFO, style(stage).bold(), steps)
        }
        ExecutionEvent::StepStarted { step_id, .. } => {
            format!("{} {}", SPINNER, style(step_id).cyan())
        }
        ExecutionEvent::StepCompleted { step_id, .. } => {
            format!("{} {}", CHECK, style(step_id).green())
        }
        ExecutionEvent::StepFailed { step_id, error, .. } => {
            format!("{} {}: {}", CROSS, style(step_id).red(), style(error).dim())
        }
        ExecutionEvent::StepSkipped { step_id, .. } => {
            format!("  {} {}", style("skipped").dim(), style(step_id).dim())
        }
        ExecutionEvent::StageCompleted { .. } => return None,
        ExecutionEvent::PhaseChanged { phase, .. } => {
            format!("{} {}", style("→").dim(), format_phase(*phase))
        }
        ExecutionEvent::ImageTagged { image, .. } => {
            format!("{} Tagged {}", PACKAGE, style(image).bold())
        }
        ExecutionEvent::Deployed { location, digest, .. } => format!(
            "{} Deployed to {} ({})",
            ROCKET,
            style(location).bold(),
            style(&digest[..digest.len().min(12)]).dim()
        ),
        ExecutionEvent::RunFinished { status, error, .. } => match (status, error) {
            (ExecutionStatus::Completed, _) => {
                format!("{} Run {}", CHECK, style("succeeded").green())
            }
            (_, Some(error)) => format!("{} Run {}: {}", CROSS, style("failed").red(), error),
            (status, None) => format!("{} Run {}", INFO, format_status(*status)),
        },
    };
    Some(line)
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
