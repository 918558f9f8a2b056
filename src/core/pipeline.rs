//! Pipeline domain model

use crate::core::{
    context::PipelineContext,
    state::{ExecutionStatus, PipelineState, StepState},
    step::Step,
};
use std::collections::HashMap;

/// An ordered, linear sequence of steps
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Variables available to every step
    pub variables: HashMap<String, String>,

    /// Steps in execution order
    pub steps: Vec<Step>,

    /// Execution state
    pub state: PipelineState,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, variables: HashMap<String, String>, steps: Vec<Step>) -> Self {
        Pipeline {
            name: name.into(),
            variables,
            steps,
            state: PipelineState::new(),
        }
    }

    /// Get a step by ID
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Get a mutable step by ID
    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Step IDs in execution order
    pub fn execution_order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }

    /// IDs of steps that completed, in order
    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| matches!(s.state, StepState::Completed { .. }))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// First failed step, if any
    pub fn failed_step(&self) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| matches!(s.state, StepState::Failed { .. }))
    }

    /// Check if every step reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.state.is_terminal())
    }

    /// Check if pipeline has failed
    pub fn has_failed(&self) -> bool {
        self.state.status == ExecutionStatus::Failed
    }

    /// Recount completed/failed steps
    pub fn update_counts(&mut self) {
        self.state.total_steps = self.steps.len();
        self.state.completed_steps = self
            .steps
            .iter()
            .filter(|s| matches!(s.state, StepState::Completed { .. }))
            .count();
        self.state.failed_steps = self
            .steps
            .iter()
            .filter(|s| matches!(s.state, StepState::Failed { .. }))
            .count();
    }

    /// Create execution context for a step
    pub fn create_context_for_step(&self, step_id: &str) -> PipelineContext {
        let mut context = PipelineContext::new();

        context.variables.extend(self.variables.clone());

        for step in &self.steps {
            if let Some(output) = step.output() {
                context.set_step_output(&step.id, output.to_string());
            }
        }

        context.current_step_id = Some(step_id.to_string());

        context
    }
}
