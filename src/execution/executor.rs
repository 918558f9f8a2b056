//! Step executor - runs individual steps inside a job container

use crate::core::{PipelineContext, Step, StepAction, TemplateError};
use crate::runner::{JobContainer, RunnerError};
use crate::stages::native::{fetch_verified, ArchiveFetcher, FetchError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Why a single step failed
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Executes a single step
pub struct StepExecutor {
    fetcher: Arc<dyn ArchiveFetcher>,
    download_dir: PathBuf,
}

impl StepExecutor {
    /// `download_dir` caches verified archives between image builds
    pub fn new(fetcher: Arc<dyn ArchiveFetcher>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            download_dir: download_dir.into(),
        }
    }

    /// Execute a step and return its output
    ///
    /// Every template is rendered before anything runs, so an unresolved
    /// placeholder fails the step without side effects.
    pub async fn execute(
        &self,
        step: &Step,
        context: &PipelineContext,
        container: &JobContainer,
    ) -> Result<String, StepError> {
        info!("Executing step: {}", step.id);

        match &step.action {
            StepAction::Exec { script } => {
                let script = context.render(script)?;
                debug!("Script for step {}: {}", step.id, script);
                let output = container.exec(&script, &[]).await?;
                Ok(output.stdout)
            }
            StepAction::CopyIn { from, to } => {
                let from = context.render(from)?;
                let to = context.render(to)?;
                container.copy_in(Path::new(&from), &to).await?;
                Ok(to)
            }
            StepAction::FetchArchive(archive) => {
                let path = fetch_verified(self.fetcher.as_ref(), archive, &self.download_dir).await?;
                Ok(path.to_string_lossy().to_string())
            }
            StepAction::Commit { tags, labels, cmd } => {
                container.commit(tags, labels, cmd).await?;
                Ok(tags
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            StepAction::Push { tags } => {
                for tag in tags {
                    container.runtime().push(tag).await?;
                }
                Ok(String::new())
            }
        }
    }
}
