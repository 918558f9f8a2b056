//! Pipeline context - shared variables and step outputs

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use thiserror::Error;

/// Error rendering a command template
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unresolved placeholder(s) {names:?} in `{template}`")]
    Unresolved { template: String, names: Vec<String> },
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Names of every `{{ name }}` placeholder in a template, in order of first use
pub fn placeholders(template: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Execution context for a pipeline run
///
/// Contains shared variables, step outputs, and run metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Global and stage-provided variables
    pub variables: HashMap<String, String>,

    /// Outputs from completed steps (step_id -> output)
    pub step_outputs: HashMap<String, String>,

    /// The current step being executed (if any)
    pub current_step_id: Option<String>,

    /// Metadata about the execution
    pub metadata: HashMap<String, String>,
}

impl PipelineContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable
    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.variables.get(key)
    }

    /// Set the output of a step
    pub fn set_step_output(&mut self, step_id: &str, output: String) {
        self.step_outputs.insert(step_id.to_string(), output);
    }

    /// Get the output of a step
    pub fn get_step_output(&self, step_id: &str) -> Option<&String> {
        self.step_outputs.get(step_id)
    }

    /// Get all variables available for rendering
    pub fn get_rendering_variables(&self) -> HashMap<String, String> {
        let mut vars = self.variables.clone();

        for (step_id, output) in &self.step_outputs {
            vars.insert(format!("steps.{}.output", step_id), output.trim().to_string());
        }

        if let Some(ref current_step) = self.current_step_id {
            vars.insert("current_step".to_string(), current_step.clone());
        }

        vars
    }

    /// Substitute `{{ name }}` placeholders
    ///
    /// Every placeholder must resolve; a command with a dangling placeholder
    /// never reaches a shell.
    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        let vars = self.get_rendering_variables();
        let mut missing = Vec::new();

        let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            match vars.get(name) {
                Some(value) => value.clone(),
                None => {
                    if !missing.iter().any(|m| m == name) {
                        missing.push(name.to_string());
                    }
                    caps[0].to_string()
                }
            }
        });

        if missing.is_empty() {
            Ok(rendered.into_owned())
        } else {
            Err(TemplateError::Unresolved {
                template: template.to_string(),
                names: missing,
            })
        }
    }
}
