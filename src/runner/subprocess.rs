//! Host subprocess runner

use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs commands as child processes of the orchestrator
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    /// Spawn the command and wait for it
    ///
    /// # Errors
    /// Returns `RunnerError` if:
    /// - The program cannot be spawned
    /// - It exits with a non-zero status
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        let line = spec.display();
        debug!("Running: {}", line);

        let mut command = Command::new(&spec.program);
        command.args(&spec.args).kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!("`{}` exited with code {}: {}", line, code, stderr);
            return Err(RunnerError::Exit {
                command: line,
                code,
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        debug!("`{}` returned {} bytes of output", line, stdout.len());

        Ok(CommandOutput { stdout, stderr })
    }
}
