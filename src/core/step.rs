//! Step domain model

use crate::core::state::StepState;
use crate::error::FailureKind;
use crate::runner::ImageRef;
use crate::stages::native::NativeArchive;
use std::collections::BTreeMap;

/// What a step does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Shell script run inside the job container (templated)
    Exec { script: String },

    /// Copy a host path into the job container (both sides templated)
    CopyIn { from: String, to: String },

    /// Download the native source archive on the host and verify its digest
    FetchArchive(NativeArchive),

    /// Snapshot the build container into tags
    Commit {
        tags: Vec<ImageRef>,
        labels: BTreeMap<String, String>,
        cmd: Vec<String>,
    },

    /// Push tags to the registry
    Push { tags: Vec<ImageRef> },
}

impl StepAction {
    /// One-line description for plans and logs
    pub fn describe(&self) -> String {
        match self {
            StepAction::Exec { script } => script.clone(),
            StepAction::CopyIn { from, to } => format!("copy {} -> {}", from, to),
            StepAction::FetchArchive(archive) => {
                format!("fetch {} (sha256 {})", archive.url, archive.short_digest())
            }
            StepAction::Commit { tags, .. } => format!("commit {}", join_tags(tags)),
            StepAction::Push { tags } => format!("push {}", join_tags(tags)),
        }
    }
}

fn join_tags(tags: &[ImageRef]) -> String {
    tags.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A single step in a pipeline
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name
    pub name: String,

    /// What the step does
    pub action: StepAction,

    /// How a failure of this step is classified
    pub failure_kind: FailureKind,

    /// Runtime state
    pub state: StepState,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            failure_kind: FailureKind::Build,
            state: StepState::Pending,
        }
    }

    /// Shorthand for an in-container shell step
    pub fn exec(id: impl Into<String>, name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(id, name, StepAction::Exec { script: script.into() })
    }

    pub fn with_failure_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = kind;
        self
    }

    /// Output of the step if it completed
    pub fn output(&self) -> Option<&str> {
        match &self.state {
            StepState::Completed { output, .. } => Some(output),
            _ => None,
        }
    }
}
