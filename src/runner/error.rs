//! Command runner error types

use thiserror::Error;

/// Error types for command execution
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code}: {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Exit code of the failed command, when it ran at all
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunnerError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}
