//! Execution engine - runs a stage's steps in order and reports progress

use crate::{
    core::{ExecutionStatus, Pipeline, RunPhase, StepState},
    error::PipelineError,
    execution::StepExecutor,
    runner::{ImageRef, JobContainer},
};
use chrono::Utc;
use std::sync::{Arc, RwLock};
use tracing::{error, info};
use uuid::Uuid;

/// Which workflow a stage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Image,
    Docs,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Image => "image",
            Stage::Docs => "docs",
            Stage::Publish => "publish",
        })
    }
}

/// Events that can occur during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunQueued {
        run_id: Uuid,
        trigger: String,
        position: usize,
    },
    StageStarted {
        run_id: Uuid,
        stage: Stage,
        steps: usize,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        name: String,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
    },
    StageCompleted {
        run_id: Uuid,
        stage: Stage,
        status: ExecutionStatus,
    },
    PhaseChanged {
        run_id: Uuid,
        phase: RunPhase,
    },
    ImageTagged {
        run_id: Uuid,
        image: ImageRef,
    },
    Deployed {
        run_id: Uuid,
        location: String,
        digest: String,
    },
    RunFinished {
        run_id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of execution events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event handler
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

/// Sequential, fail-fast step runner
pub struct ExecutionEngine {
    executor: Arc<StepExecutor>,
    events: EventBus,
}

impl ExecutionEngine {
    pub fn new(executor: StepExecutor, events: EventBus) -> Self {
        Self {
            executor: Arc::new(executor),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Execute every step of `pipeline` inside `container`.
    ///
    /// The first failing step fails the stage; the remaining steps are
    /// marked skipped and nothing is retried.
    pub async fn execute(
        &self,
        stage: Stage,
        pipeline: &mut Pipeline,
        container: &JobContainer,
    ) -> Result<(), PipelineError> {
        let run_id = pipeline.state.execution_id;

        info!("Starting {} stage: {} ({})", stage, pipeline.name, run_id);
        self.events.emit(ExecutionEvent::StageStarted {
            run_id,
            stage,
            steps: pipeline.steps.len(),
        });
        pipeline.state.start(pipeline.steps.len());

        let order: Vec<String> = pipeline
            .execution_order()
            .into_iter()
            .map(str::to_string)
            .collect();

        for (index, step_id) in order.iter().enumerate() {
            if let Err(e) = self.execute_step(pipeline, step_id, container).await {
                for skipped in &order[index + 1..] {
                    if let Some(step) = pipeline.step_mut(skipped) {
                        step.state = StepState::Skipped {
                            reason: format!("`{}` failed", step_id),
                        };
                    }
                    self.events.emit(ExecutionEvent::StepSkipped {
                        run_id,
                        step_id: skipped.clone(),
                    });
                }
                pipeline.update_counts();
                pipeline.state.fail();
                self.events.emit(ExecutionEvent::StageCompleted {
                    run_id,
                    stage,
                    status: ExecutionStatus::Failed,
                });
                return Err(e);
            }
            pipeline.update_counts();
        }

        pipeline.state.complete();
        info!("{} stage finished: {}", stage, pipeline.name);
        self.events.emit(ExecutionEvent::StageCompleted {
            run_id,
            stage,
            status: ExecutionStatus::Completed,
        });
        Ok(())
    }

    /// Execute a single step
    async fn execute_step(
        &self,
        pipeline: &mut Pipeline,
        step_id: &str,
        container: &JobContainer,
    ) -> Result<(), PipelineError> {
        let run_id = pipeline.state.execution_id;
        let Some(step) = pipeline.step(step_id).cloned() else {
            return Err(PipelineError::Config(format!("Step {} not found", step_id)));
        };

        let started_at = Utc::now();
        if let Some(s) = pipeline.step_mut(step_id) {
            s.state = StepState::Running { started_at };
        }
        self.events.emit(ExecutionEvent::StepStarted {
            run_id,
            step_id: step.id.clone(),
            name: step.name.clone(),
        });

        let context = pipeline.create_context_for_step(step_id);
        match self.executor.execute(&step, &context, container).await {
            Ok(output) => {
                if let Some(s) = pipeline.step_mut(step_id) {
                    s.state = StepState::Completed {
                        output,
                        started_at,
                        completed_at: Utc::now(),
                    };
                }
                self.events.emit(ExecutionEvent::StepCompleted {
                    run_id,
                    step_id: step.id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                error!("Step {} failed: {}", step_id, e);
                if let Some(s) = pipeline.step_mut(step_id) {
                    s.state = StepState::Failed {
                        error: e.to_string(),
                        started_at,
                        failed_at: Utc::now(),
                    };
                }
                self.events.emit(ExecutionEvent::StepFailed {
                    run_id,
                    step_id: step.id.clone(),
                    error: e.to_string(),
                });
                Err(PipelineError::Step {
                    step: step.id,
                    kind: step.failure_kind,
                    source: e,
                })
            }
        }
    }
}
