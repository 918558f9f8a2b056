//! Publish stage - upload, configure target, deploy

use crate::core::permissions::{IdentityToken, Permissions, TOKEN_LIFETIME_MINUTES};
use crate::core::{PhaseTracker, RunPhase};
use crate::error::PipelineError;
use crate::execution::concurrency::Permit;
use crate::execution::engine::{EventBus, ExecutionEvent};
use crate::stages::artifact::{Artifact, ArtifactStore};
use crate::stages::docs::BuildOutput;
use crate::stages::target::{DeployError, DeployReceipt, DeployTarget};
use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

/// Audience the deploy identity token is minted for
pub const TOKEN_AUDIENCE: &str = "pages";

/// Result of a successful publish
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub artifact: Artifact,
    pub receipt: DeployReceipt,
}

/// Deploys build outputs while holding the publish group
pub struct Publisher {
    permissions: Permissions,
    store: ArtifactStore,
    target: Arc<dyn DeployTarget>,
    events: EventBus,
    token_lifetime: Duration,
}

impl Publisher {
    pub fn new(
        permissions: Permissions,
        store: ArtifactStore,
        target: Arc<dyn DeployTarget>,
        events: EventBus,
    ) -> Self {
        Self {
            permissions,
            store,
            target,
            events,
            token_lifetime: Duration::minutes(TOKEN_LIFETIME_MINUTES),
        }
    }

    /// How long each minted identity token stays valid
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    pub fn target(&self) -> &Arc<dyn DeployTarget> {
        &self.target
    }

    fn advance(&self, tracker: &mut PhaseTracker, output: &BuildOutput, phase: RunPhase) -> Result<(), PipelineError> {
        tracker.advance(phase)?;
        self.events.emit(ExecutionEvent::PhaseChanged {
            run_id: output.run_id(),
            phase,
        });
        Ok(())
    }

    fn mint_token(&self, output: &BuildOutput) -> Result<IdentityToken, PipelineError> {
        self.permissions
            .mint_identity_token_for(output.run_id(), TOKEN_AUDIENCE, self.token_lifetime)
            .map_err(PipelineError::Permission)
    }

    /// Publish `output`.
    ///
    /// Requires the publish permit, and a run in the Queued phase; drives it
    /// through Uploading, ConfiguringTarget and Deploying to Deployed.
    pub async fn publish(
        &self,
        output: &BuildOutput,
        permit: &Permit<'_>,
        tracker: &mut PhaseTracker,
    ) -> Result<PublishReport, PipelineError> {
        let run_id = output.run_id();
        if permit.run_id() != run_id {
            return Err(PipelineError::Permission(format!(
                "permit for run {} cannot publish run {}",
                permit.run_id(),
                run_id
            )));
        }
        self.permissions
            .check_publish()
            .map_err(PipelineError::Permission)?;

        self.advance(tracker, output, RunPhase::Uploading)?;
        let artifact = self.store.upload(output).await.map_err(|e| PipelineError::Deploy {
            phase: RunPhase::Uploading,
            source: DeployError::Io(e),
        })?;

        self.advance(tracker, output, RunPhase::ConfiguringTarget)?;
        let token = self.mint_token(output)?;
        self.target
            .configure(&token)
            .await
            .map_err(|source| PipelineError::Deploy {
                phase: RunPhase::ConfiguringTarget,
                source,
            })?;

        self.advance(tracker, output, RunPhase::Deploying)?;
        info!(run_id = %run_id, group = permit.group(), "Deploying to {}", self.target.describe());
        let token = self.mint_token(output)?;
        let receipt = self
            .target
            .deploy(&artifact, &token)
            .await
            .map_err(|source| PipelineError::Deploy {
                phase: RunPhase::Deploying,
                source,
            })?;

        self.advance(tracker, output, RunPhase::Deployed)?;
        self.events.emit(ExecutionEvent::Deployed {
            run_id,
            location: receipt.location.clone(),
            digest: receipt.digest.clone(),
        });

        match self.store.prune_except(run_id).await {
            Ok(0) => {}
            Ok(removed) => info!(run_id = %run_id, removed, "Pruned superseded artifacts"),
            Err(e) => warn!("Failed to prune artifacts in {}: {}", self.store.root().display(), e),
        }

        Ok(PublishReport { artifact, receipt })
    }
}
