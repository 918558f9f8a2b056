//! Pipeline error types

use crate::core::state::{InvalidTransition, RunPhase};
use crate::execution::concurrency::ConcurrencyError;
use crate::execution::executor::StepError;
use crate::runner::RunnerError;
use crate::stages::target::DeployError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Downloading or pushing something over the network
    Fetch,
    /// Configure/compile/install or dependency resolution
    Build,
    /// The site generator
    Generator,
    /// Upload, target configuration or deployment
    Deployment,
    /// Invalid configuration or permissions
    Configuration,
    /// A job exceeded its timeout
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Build => "build",
            FailureKind::Generator => "generator",
            FailureKind::Deployment => "deployment",
            FailureKind::Configuration => "configuration",
            FailureKind::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<FailureKind> {
        match value {
            "fetch" => Some(FailureKind::Fetch),
            "build" => Some(FailureKind::Build),
            "generator" => Some(FailureKind::Generator),
            "deployment" => Some(FailureKind::Deployment),
            "configuration" => Some(FailureKind::Configuration),
            "timeout" => Some(FailureKind::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error that aborts a run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("step `{step}` failed ({kind}): {source}")]
    Step {
        step: String,
        kind: FailureKind,
        #[source]
        source: StepError,
    },

    #[error("no image built for the current lock file; expected {expected} (run the image stage first)")]
    StaleImage { expected: String, digest: String },

    #[error("could not pull {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: RunnerError,
    },

    #[error("lock file {0} not found")]
    MissingLockFile(String),

    #[error("site generator produced no output in {0}")]
    EmptyOutput(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("{phase} failed: {source}")]
    Deploy {
        phase: RunPhase,
        #[source]
        source: DeployError,
    },

    #[error("job `{job}` timed out after {after:?}")]
    Timeout { job: String, after: Duration },

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RunnerError),

    #[error("checkout failed: {0}")]
    Checkout(#[source] std::io::Error),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Failure classification recorded in run history
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Config(_)
            | PipelineError::StaleImage { .. }
            | PipelineError::Permission(_)
            | PipelineError::Concurrency(_)
            | PipelineError::Transition(_) => FailureKind::Configuration,
            PipelineError::Step { kind, .. } => *kind,
            PipelineError::EmptyOutput(_) => FailureKind::Generator,
            PipelineError::Deploy { .. } => FailureKind::Deployment,
            PipelineError::Timeout { .. } => FailureKind::Timeout,
            PipelineError::Checkout(_) | PipelineError::Pull { .. } => FailureKind::Fetch,
            PipelineError::MissingLockFile(_) | PipelineError::Runtime(_) | PipelineError::Io(_) => {
                FailureKind::Build
            }
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
