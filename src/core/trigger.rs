//! Run triggers - branch pushes and manual dispatch

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What started a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TriggerKind {
    /// A push to a branch
    Push { branch: String },
    /// Manual dispatch
    Manual,
}

/// A trigger event; pushes and manual dispatches are handled identically
/// once accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,

    /// Commit the run is for, if known
    #[serde(default)]
    pub revision: Option<String>,

    /// Who triggered it
    #[serde(default)]
    pub actor: Option<String>,

    /// Trigger time; deploy ordering follows this
    pub at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>) -> Self {
        Self {
            kind: TriggerKind::Push {
                branch: branch.into(),
            },
            revision: None,
            actor: None,
            at: Utc::now(),
        }
    }

    pub fn manual() -> Self {
        Self {
            kind: TriggerKind::Manual,
            revision: None,
            actor: None,
            at: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn branch(&self) -> Option<&str> {
        match &self.kind {
            TriggerKind::Push { branch } => Some(branch),
            TriggerKind::Manual => None,
        }
    }

    /// Short human description, e.g. `push to main @ 1a2b3c4`
    pub fn describe(&self) -> String {
        let base = match &self.kind {
            TriggerKind::Push { branch } => format!("push to {}", branch),
            TriggerKind::Manual => "manual dispatch".to_string(),
        };
        match &self.revision {
            Some(rev) => format!("{} @ {}", base, rev.chars().take(7).collect::<String>()),
            None => base,
        }
    }
}

/// Push trigger filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTrigger {
    /// Branch patterns; `*` matches within a path segment, `**` across them
    pub branches: Vec<String>,
}

/// Which events start a documentation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_push")]
    pub push: Option<PushTrigger>,

    #[serde(default = "default_manual")]
    pub manual: bool,
}

fn default_push() -> Option<PushTrigger> {
    Some(PushTrigger {
        branches: vec!["main".to_string()],
    })
}

fn default_manual() -> bool {
    true
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            push: default_push(),
            manual: default_manual(),
        }
    }
}

impl TriggerConfig {
    /// Whether `event` should start a run
    pub fn accepts(&self, event: &TriggerEvent) -> bool {
        match &event.kind {
            TriggerKind::Manual => self.manual,
            TriggerKind::Push { branch } => self
                .push
                .as_ref()
                .is_some_and(|push| push.branches.iter().any(|p| branch_matches(p, branch))),
        }
    }
}

/// Match a branch name against a glob-style pattern
pub fn branch_matches(pattern: &str, branch: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == branch;
    }

    let mut regex = String::from("^");
    let mut rest = pattern;
    while let Some(idx) = rest.find('*') {
        regex.push_str(&regex::escape(&rest[..idx]));
        if rest[idx..].starts_with("**") {
            regex.push_str(".*");
            rest = &rest[idx + 2..];
        } else {
            regex.push_str("[^/]*");
            rest = &rest[idx + 1..];
        }
    }
    regex.push_str(&regex::escape(rest));
    regex.push('$');

    Regex::new(&regex)
        .map(|re| re.is_match(branch))
        .unwrap_or(false)
}
