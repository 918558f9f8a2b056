//! Pipeline execution - step running, concurrency groups and run dispatch

pub mod concurrency;
pub mod dispatcher;
pub mod engine;
pub mod executor;

pub use concurrency::{ConcurrencyBackend, ConcurrencyGroups, FileTicketQueue, Permit, Ticket};
pub use dispatcher::{Dispatcher, EnvLookup, QueuedRun, RunReport};
pub use engine::{EventBus, ExecutionEngine, ExecutionEvent, Stage};
pub use executor::{StepError, StepExecutor};
