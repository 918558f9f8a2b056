//! Dispatcher - turns trigger events into documentation runs
//!
//! A run is two jobs. The build job checks out the source, builds the site
//! in the current image and hands a [`BuildOutput`] to the deploy job. The
//! deploy job waits for the publish group in trigger order and deploys.
//! The job timeout applies to each job separately; time spent queued does
//! not count.

use crate::core::config::PipelineConfig;
use crate::core::{ExecutionStatus, PhaseTracker, RunPhase, TriggerEvent};
use crate::error::{FailureKind, PipelineError};
use crate::execution::concurrency::{ConcurrencyBackend, Ticket};
use crate::execution::engine::{ExecutionEngine, ExecutionEvent};
use crate::persistence::{PersistenceBackend, RunSummary, Workflow};
use crate::runner::{ImageRef, Runtime};
use crate::stages::docs::{docs_flag_enabled, BuildOutput, DocsBuilder, RunInfo};
use crate::stages::image::{ImageBuilder, ImageReport};
use crate::stages::publish::{PublishReport, Publisher};
use crate::stages::resolver::DependencyGroups;
use crate::tree::copy_tree;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Looks up an environment variable
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// An accepted trigger holding its place in the publish queue
#[derive(Debug)]
pub struct QueuedRun {
    pub run_id: Uuid,
    pub event: TriggerEvent,
    ticket: Ticket,
}

impl QueuedRun {
    /// Runs ahead of this one in the publish queue
    pub fn position(&self) -> usize {
        self.ticket.position()
    }
}

/// Outcome of a documentation run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub trigger: String,
    pub status: ExecutionStatus,
    /// Final phase
    pub phase: RunPhase,
    /// Every phase visited, in order
    pub phases: Vec<RunPhase>,
    pub image: Option<ImageRef>,
    pub groups: Option<DependencyGroups>,
    pub publish: Option<PublishReport>,
    pub error: Option<PipelineError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.error.as_ref().map(PipelineError::kind)
    }

    pub fn summary(&self, pipeline_name: &str) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            pipeline_name: pipeline_name.to_string(),
            workflow: Workflow::Docs,
            trigger: self.trigger.clone(),
            status: self.status,
            phase: Some(self.phase),
            started_at: self.started_at,
            completed_at: Some(self.completed_at),
            image: self.image.as_ref().map(ToString::to_string),
            artifact_digest: self
                .publish
                .as_ref()
                .map(|p| p.artifact.digest.to_string()),
            failure: self.failure(),
            error: self.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Entry point for image builds and documentation runs
pub struct Dispatcher {
    config: Arc<PipelineConfig>,
    engine: Arc<ExecutionEngine>,
    concurrency: Arc<dyn ConcurrencyBackend>,
    images: ImageBuilder,
    docs: DocsBuilder,
    publisher: Publisher,
    workspace_root: PathBuf,
    env: EnvLookup,
    history: Option<Arc<dyn PersistenceBackend>>,
    job_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher
    ///
    /// Each run checks out into its own directory under `workspace_root`.
    pub fn new(
        config: Arc<PipelineConfig>,
        runtime: Runtime,
        engine: Arc<ExecutionEngine>,
        concurrency: Arc<dyn ConcurrencyBackend>,
        publisher: Publisher,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        let job_timeout = Duration::from_secs(config.defaults.timeout_minutes * 60);
        Self {
            images: ImageBuilder::new(config.clone(), runtime.clone(), engine.clone(), concurrency.clone()),
            docs: DocsBuilder::new(config.clone(), runtime, engine.clone()),
            config,
            engine,
            concurrency,
            publisher,
            workspace_root: workspace_root.into(),
            env: Arc::new(|name: &str| std::env::var(name).ok()),
            history: None,
            job_timeout,
        }
    }

    /// Read the docs flag from `env` instead of the process environment
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    /// Record runs in `history`
    pub fn with_history(mut self, history: Arc<dyn PersistenceBackend>) -> Self {
        self.history = Some(history);
        self
    }

    /// Override `defaults.timeout_minutes`
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Accept `event` and take its place in the publish queue.
    ///
    /// Returns `None` when the trigger configuration does not accept it.
    pub fn trigger(&self, event: TriggerEvent) -> Result<Option<QueuedRun>, PipelineError> {
        if !self.config.triggers.accepts(&event) {
            info!("Ignoring {}: not accepted by triggers", event.describe());
            return Ok(None);
        }

        let run_id = Uuid::new_v4();
        let ticket = self
            .concurrency
            .enqueue(&self.config.publish.concurrency.group, run_id)?;
        let position = ticket.position();

        info!(run_id = %run_id, position, "Accepted {}", event.describe());
        self.engine.events().emit(ExecutionEvent::RunQueued {
            run_id,
            trigger: event.describe(),
            position,
        });

        Ok(Some(QueuedRun { run_id, event, ticket }))
    }

    /// Trigger and run in one go
    pub async fn dispatch(&self, event: TriggerEvent) -> Result<Option<RunReport>, PipelineError> {
        match self.trigger(event)? {
            Some(queued) => Ok(Some(self.run(queued).await)),
            None => Ok(None),
        }
    }

    /// Run an accepted trigger to completion.
    ///
    /// Never publishes unless the build succeeded. Failures are reported
    /// in the returned [`RunReport`].
    pub async fn run(&self, queued: QueuedRun) -> RunReport {
        let QueuedRun { run_id, event, ticket } = queued;
        let started_at = Utc::now();
        let trigger = event.describe();
        let run = RunInfo {
            run_id,
            revision: event.revision.clone(),
            branch: event.branch().map(str::to_string),
        };

        self.record(&RunSummary {
            run_id,
            pipeline_name: self.config.name.clone(),
            workflow: Workflow::Docs,
            trigger: trigger.clone(),
            status: ExecutionStatus::Running,
            phase: Some(RunPhase::Idle),
            started_at,
            completed_at: None,
            image: None,
            artifact_digest: None,
            failure: None,
            error: None,
        })
        .await;

        let workspace = self.workspace_root.join(run_id.to_string());
        let mut tracker = PhaseTracker::new();
        let mut built: Option<BuildOutput> = None;

        let outcome = match self.build_job(&workspace, &run, &mut tracker).await {
            Ok(output) => {
                let result = self.deploy_job(&output, ticket, &mut tracker).await;
                built = Some(output);
                result
            }
            Err(e) => {
                drop(ticket);
                Err(e)
            }
        };

        if workspace.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
                warn!("Failed to remove workspace {}: {}", workspace.display(), e);
            }
        }

        let (publish, error) = match outcome {
            Ok(report) => (Some(report), None),
            Err(e) => {
                error!(run_id = %run_id, kind = %e.kind(), "Run failed: {}", e);
                if !tracker.current().is_terminal() && tracker.advance(RunPhase::Failed).is_ok() {
                    self.engine.events().emit(ExecutionEvent::PhaseChanged {
                        run_id,
                        phase: RunPhase::Failed,
                    });
                }
                (None, Some(e))
            }
        };

        let status = if error.is_none() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        let report = RunReport {
            run_id,
            trigger,
            status,
            phase: tracker.current(),
            phases: tracker.phases(),
            image: built.as_ref().map(|output| output.image().clone()),
            groups: built.as_ref().map(|output| output.groups().clone()),
            publish,
            error,
            started_at,
            completed_at: Utc::now(),
        };

        self.record(&report.summary(&self.config.name)).await;
        self.engine.events().emit(ExecutionEvent::RunFinished {
            run_id,
            status,
            error: report.error.as_ref().map(ToString::to_string),
        });
        report
    }

    async fn build_job(
        &self,
        workspace: &Path,
        run: &RunInfo,
        tracker: &mut PhaseTracker,
    ) -> Result<BuildOutput, PipelineError> {
        self.checkout(workspace).await?;

        let flag_enabled = docs_flag_enabled(&self.config, &*self.env);
        info!(run_id = %run.run_id, flag_enabled, "Starting docs build");

        self.with_timeout("docs", self.docs.build(workspace, run, flag_enabled, tracker))
            .await
    }

    async fn deploy_job(
        &self,
        output: &BuildOutput,
        ticket: Ticket,
        tracker: &mut PhaseTracker,
    ) -> Result<PublishReport, PipelineError> {
        let run_id = output.run_id();
        tracker.advance(RunPhase::Queued)?;
        self.engine.events().emit(ExecutionEvent::PhaseChanged {
            run_id,
            phase: RunPhase::Queued,
        });

        if ticket.position() > 0 {
            info!(run_id = %run_id, ahead = ticket.position(), "Waiting for {}", ticket.group());
        }
        let permit = ticket.wait_turn().await?;
        self.with_timeout("publish", self.publisher.publish(output, &permit, tracker))
            .await
    }

    /// Copy the source tree into a fresh workspace
    async fn checkout(&self, workspace: &Path) -> Result<(), PipelineError> {
        let source = self.config.image.source.clone();
        let output_dir = self.config.docs.output_dir.clone();
        let dest = workspace.to_path_buf();

        let copied = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            if dest.exists() {
                std::fs::remove_dir_all(&dest)?;
            }
            copy_tree(&source, &dest, &[".git", output_dir.as_str()])
        })
        .await
        .map_err(|e| PipelineError::Checkout(std::io::Error::other(e)))?
        .map_err(PipelineError::Checkout)?;

        info!("Checked out {} files into {}", copied, workspace.display());
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        job: &str,
        future: impl Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        match tokio::time::timeout(self.job_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                job: job.to_string(),
                after: self.job_timeout,
            }),
        }
    }

    /// Build and tag the image for the current lock file
    pub async fn build_image(&self, run_id: Uuid) -> Result<ImageReport, PipelineError> {
        let started_at = Utc::now();
        let outcome = self.with_timeout("image", self.images.build(run_id)).await;

        let (status, error) = match &outcome {
            Ok(_) => (ExecutionStatus::Completed, None),
            Err(e) => {
                error!(run_id = %run_id, kind = %e.kind(), "Image build failed: {}", e);
                (ExecutionStatus::Failed, Some(e))
            }
        };

        self.record(&RunSummary {
            run_id,
            pipeline_name: self.config.name.clone(),
            workflow: Workflow::Image,
            trigger: "image build".to_string(),
            status,
            phase: None,
            started_at,
            completed_at: Some(Utc::now()),
            image: outcome.as_ref().ok().map(|r| r.image.to_string()),
            artifact_digest: None,
            failure: error.map(PipelineError::kind),
            error: error.map(ToString::to_string),
        })
        .await;
        self.engine.events().emit(ExecutionEvent::RunFinished {
            run_id,
            status,
            error: error.map(ToString::to_string),
        });

        outcome
    }

    async fn record(&self, summary: &RunSummary) {
        if let Some(history) = &self.history {
            if let Err(e) = history.save_run(summary).await {
                warn!("Failed to record run {}: {:#}", summary.run_id, e);
            }
        }
    }
}
