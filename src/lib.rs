//! docs-pipeline - builds a reproducible docs image and publishes the site

pub mod cli;
pub mod core;
pub mod digest;
pub mod error;
pub mod execution;
pub mod persistence;
pub mod runner;
pub mod stages;
pub mod tree;

// Re-export commonly used types
pub use core::config::PipelineConfig;
pub use core::{ExecutionStatus, Pipeline, PipelineContext, RunPhase, Step, StepState, TriggerEvent};
pub use error::{FailureKind, PipelineError};
pub use execution::{Dispatcher, EventBus, ExecutionEngine, ExecutionEvent, RunReport, StepExecutor};
pub use runner::{CommandRunner, ImageRef, Runtime, RuntimeKind, ShellRunner};
