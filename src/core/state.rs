//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Run has not started
    Pending,
    /// Run is currently executing or waiting for its deploy slot
    Running,
    /// Run completed successfully
    Completed,
    /// Run failed
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "Running" => ExecutionStatus::Running,
            "Completed" => ExecutionStatus::Completed,
            "Failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Pending,
        }
    }
}

/// State of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepState {
    /// Step has not run yet
    Pending,
    /// Step is currently running
    Running { started_at: DateTime<Utc> },
    /// Step completed successfully
    Completed {
        output: String,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Step failed; the run stops here
    Failed {
        error: String,
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
    /// Step never ran because an earlier step failed
    Skipped { reason: String },
}

impl StepState {
    /// Check if step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed { .. } | StepState::Failed { .. } | StepState::Skipped { .. }
        )
    }
}

/// Overall pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Current execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: Option<DateTime<Utc>>,

    /// When execution completed/failed
    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of steps
    pub total_steps: usize,

    /// Number of completed steps
    pub completed_steps: usize,

    /// Number of failed steps
    pub failed_steps: usize,
}

impl PipelineState {
    /// Create a new pipeline state
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            total_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
        }
    }

    /// Mark pipeline as started
    pub fn start(&mut self, total_steps: usize) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_steps = total_steps;
    }

    /// Mark pipeline as completed
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark pipeline as failed
    pub fn fail(&mut self) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Calculate progress percentage (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.completed_steps + self.failed_steps) as f64 / self.total_steps as f64
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Phase of a documentation run.
///
/// Covers both the build job (Idle → Provisioning → Building →
/// BuildComplete) and the deploy job (Queued → Uploading →
/// ConfiguringTarget → Deploying → Deployed). Any non-terminal phase may
/// move to Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Provisioning,
    Building,
    BuildComplete,
    /// Waiting for the deploy concurrency group
    Queued,
    Uploading,
    ConfiguringTarget,
    Deploying,
    Deployed,
    Failed,
}

/// Attempted an edge the run state machine does not have
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid phase transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RunPhase,
    pub to: RunPhase,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Deployed | RunPhase::Failed)
    }

    /// Phases that belong to the deploy job
    pub fn is_publishing(&self) -> bool {
        matches!(
            self,
            RunPhase::Queued
                | RunPhase::Uploading
                | RunPhase::ConfiguringTarget
                | RunPhase::Deploying
                | RunPhase::Deployed
        )
    }

    /// The single successor on the happy path
    pub fn next(&self) -> Option<RunPhase> {
        match self {
            RunPhase::Idle => Some(RunPhase::Provisioning),
            RunPhase::Provisioning => Some(RunPhase::Building),
            RunPhase::Building => Some(RunPhase::BuildComplete),
            RunPhase::BuildComplete => Some(RunPhase::Queued),
            RunPhase::Queued => Some(RunPhase::Uploading),
            RunPhase::Uploading => Some(RunPhase::ConfiguringTarget),
            RunPhase::ConfiguringTarget => Some(RunPhase::Deploying),
            RunPhase::Deploying => Some(RunPhase::Deployed),
            RunPhase::Deployed | RunPhase::Failed => None,
        }
    }

    /// Parse the name produced by `Display`
    pub fn parse(value: &str) -> Option<RunPhase> {
        [
            RunPhase::Idle,
            RunPhase::Provisioning,
            RunPhase::Building,
            RunPhase::BuildComplete,
            RunPhase::Queued,
            RunPhase::Uploading,
            RunPhase::ConfiguringTarget,
            RunPhase::Deploying,
            RunPhase::Deployed,
            RunPhase::Failed,
        ]
        .into_iter()
        .find(|phase| phase.to_string() == value)
    }

    /// Move to `to` if the state machine allows it
    pub fn advance(self, to: RunPhase) -> Result<RunPhase, InvalidTransition> {
        let allowed = if to == RunPhase::Failed {
            !self.is_terminal()
        } else {
            self.next() == Some(to)
        };

        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A recorded phase change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: RunPhase,
    pub at: DateTime<Utc>,
}

/// Current phase plus the history of how the run got there
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTracker {
    current: RunPhase,
    history: Vec<PhaseChange>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: RunPhase::Idle,
            history: vec![PhaseChange {
                phase: RunPhase::Idle,
                at: Utc::now(),
            }],
        }
    }

    pub fn current(&self) -> RunPhase {
        self.current
    }

    pub fn history(&self) -> &[PhaseChange] {
        &self.history
    }

    /// Phases visited, in order
    pub fn phases(&self) -> Vec<RunPhase> {
        self.history.iter().map(|change| change.phase).collect()
    }

    pub fn advance(&mut self, to: RunPhase) -> Result<(), InvalidTransition> {
        self.current = self.current.advance(to)?;
        self.history.push(PhaseChange {
            phase: to,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Whether the run ever entered `phase`
    pub fn visited(&self, phase: RunPhase) -> bool {
        self.history.iter().any(|change| change.phase == phase)
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
