//! CLI command definitions

use crate::core::TriggerEvent;
use crate::persistence::Workflow;
use clap::Args;

/// Build the docs site for a trigger and publish it
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Treat the run as a manual dispatch (the default)
    #[arg(long, conflicts_with = "branch")]
    pub manual: bool,

    /// Treat the run as a push to this branch
    #[arg(long)]
    pub branch: Option<String>,

    /// Commit the run is for
    #[arg(long)]
    pub revision: Option<String>,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

impl RunCommand {
    /// The trigger event this invocation stands for
    pub fn event(&self) -> TriggerEvent {
        let event = match &self.branch {
            Some(branch) if !self.manual => TriggerEvent::push(branch.clone()),
            _ => TriggerEvent::manual(),
        };
        let event = match std::env::var("USER") {
            Ok(user) => event.with_actor(user),
            Err(_) => event,
        };
        match &self.revision {
            Some(revision) => event.with_revision(revision.clone()),
            None => event,
        }
    }
}

/// Build and tag the runtime image
#[derive(Debug, Args, Clone)]
pub struct ImageCommand {
    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,

    /// Don't save the build to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Print the rendered steps of both workflows
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Docs flag value to plan with (defaults to the environment)
    #[arg(long)]
    pub docs_flag: Option<String>,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub var: Vec<(String, String)>,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Only show runs of this workflow
    #[arg(short, long, value_enum)]
    pub workflow: Option<WorkflowArg>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Workflow argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WorkflowArg {
    Image,
    Docs,
}

impl From<WorkflowArg> for Workflow {
    fn from(arg: WorkflowArg) -> Self {
        match arg {
            WorkflowArg::Image => Workflow::Image,
            WorkflowArg::Docs => Workflow::Docs,
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
