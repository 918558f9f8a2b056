//! Core domain models
//!
//! Configuration, the linear step model both stages are planned into,
//! run phases, and the trigger/permission rules that gate a run.

pub mod config;
pub mod context;
pub mod permissions;
pub mod pipeline;
pub mod state;
pub mod step;
pub mod trigger;

pub use context::*;
pub use pipeline::*;
pub use state::*;
pub use step::*;
pub use trigger::{TriggerConfig, TriggerEvent, TriggerKind};
