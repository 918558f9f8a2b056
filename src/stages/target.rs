//! Hosting targets the documentation artifact is deployed to

use crate::core::config::TargetConfig;
use crate::core::permissions::IdentityToken;
use crate::runner::{CommandRunner, CommandSpec, RunnerError};
use crate::stages::artifact::{unpack, Artifact};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Error configuring a target or deploying to it
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("identity token for run {0} has expired")]
    TokenExpired(Uuid),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where and how a deployment landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReceipt {
    pub run_id: Uuid,
    pub location: String,
    pub digest: String,
}

/// A hosting target
#[async_trait]
pub trait DeployTarget: Send + Sync {
    /// Short description for logs and plans
    fn describe(&self) -> String;

    /// Prepare the target for a deployment
    async fn configure(&self, token: &IdentityToken) -> Result<(), DeployError>;

    /// Make `artifact` the live site
    async fn deploy(&self, artifact: &Artifact, token: &IdentityToken) -> Result<DeployReceipt, DeployError>;
}

/// Build the target described by the configuration
pub fn target_from_config(config: &TargetConfig, runner: Arc<dyn CommandRunner>) -> Arc<dyn DeployTarget> {
    match config {
        TargetConfig::Directory { path } => Arc::new(DirectoryTarget::new(path.clone())),
        TargetConfig::Command { configure, deploy } => Arc::new(CommandTarget {
            configure: configure.clone(),
            deploy: deploy.clone(),
            runner,
        }),
    }
}

fn check_token(token: &IdentityToken) -> Result<(), DeployError> {
    if token.is_expired() {
        return Err(DeployError::TokenExpired(token.run_id));
    }
    Ok(())
}

/// Serves the site from a local directory.
///
/// A deployment unpacks next to the live directory and swaps it in with
/// renames, so readers see either the old tree or the new one.
#[derive(Debug, Clone)]
pub struct DirectoryTarget {
    path: PathBuf,
}

impl DirectoryTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str, run_id: Uuid) -> Result<PathBuf, DeployError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| DeployError::InvalidTarget(self.path.display().to_string()))?;
        let name = self
            .path
            .file_name()
            .ok_or_else(|| DeployError::InvalidTarget(self.path.display().to_string()))?
            .to_string_lossy();
        Ok(parent.join(format!(".{}.{}-{}", name, suffix, run_id.simple())))
    }

    /// Move `staging` into place, keeping the old tree at `previous`
    fn swap(&self, staging: &Path, previous: &Path) -> Result<(), DeployError> {
        let had_live = self.path.exists();
        if had_live {
            std::fs::rename(&self.path, previous)?;
        }
        if let Err(e) = std::fs::rename(staging, &self.path) {
            if had_live {
                std::fs::rename(previous, &self.path)?;
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl DeployTarget for DirectoryTarget {
    fn describe(&self) -> String {
        format!("directory {}", self.path.display())
    }

    async fn configure(&self, token: &IdentityToken) -> Result<(), DeployError> {
        check_token(token)?;
        let parent = self
            .path
            .parent()
            .ok_or_else(|| DeployError::InvalidTarget(self.path.display().to_string()))?;
        tokio::fs::create_dir_all(parent).await?;
        Ok(())
    }

    async fn deploy(&self, artifact: &Artifact, token: &IdentityToken) -> Result<DeployReceipt, DeployError> {
        check_token(token)?;
        let staging = self.sibling("staging", artifact.run_id)?;
        let previous = self.sibling("previous", artifact.run_id)?;

        let unpacked = staging.clone();
        let archive = artifact.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DeployError> {
            if unpacked.exists() {
                std::fs::remove_dir_all(&unpacked)?;
            }
            if let Err(e) = unpack(&archive, &unpacked) {
                let _ = std::fs::remove_dir_all(&unpacked);
                return Err(e.into());
            }
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;

        // Runs inline: once this future is dropped nothing touches the live tree
        self.swap(&staging, &previous)?;

        if previous.exists() {
            tokio::task::spawn_blocking(move || std::fs::remove_dir_all(previous))
                .await
                .map_err(std::io::Error::other)??;
        }

        info!(run_id = %artifact.run_id, "Deployed to {}", self.path.display());
        Ok(DeployReceipt {
            run_id: artifact.run_id,
            location: self.path.display().to_string(),
            digest: artifact.digest.to_string(),
        })
    }
}

/// Hands the artifact to external commands
pub struct CommandTarget {
    configure: Option<String>,
    deploy: String,
    runner: Arc<dyn CommandRunner>,
}

impl CommandTarget {
    pub fn new(configure: Option<String>, deploy: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            configure,
            deploy: deploy.into(),
            runner,
        }
    }

    fn command(&self, script: &str, token: &IdentityToken, artifact: Option<&Artifact>) -> CommandSpec {
        let mut spec = CommandSpec::shell(script)
            .env("DEPLOY_TOKEN", token.value.clone())
            .env("RUN_ID", token.run_id.to_string());
        if let Some(artifact) = artifact {
            spec = spec
                .env("ARTIFACT_PATH", artifact.path.to_string_lossy().to_string())
                .env("ARTIFACT_DIGEST", artifact.digest.to_string());
        }
        spec
    }
}

#[async_trait]
impl DeployTarget for CommandTarget {
    fn describe(&self) -> String {
        format!("command `{}`", self.deploy)
    }

    async fn configure(&self, token: &IdentityToken) -> Result<(), DeployError> {
        check_token(token)?;
        if let Some(script) = &self.configure {
            debug!("Configuring target: {}", script);
            self.runner.run(&self.command(script, token, None)).await?;
        }
        Ok(())
    }

    async fn deploy(&self, artifact: &Artifact, token: &IdentityToken) -> Result<DeployReceipt, DeployError> {
        check_token(token)?;
        let output = self
            .runner
            .run(&self.command(&self.deploy, token, Some(artifact)))
            .await?;

        let location = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or(&self.deploy)
            .to_string();

        Ok(DeployReceipt {
            run_id: artifact.run_id,
            location,
            digest: artifact.digest.to_string(),
        })
    }
}
