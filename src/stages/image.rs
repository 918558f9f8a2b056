//! Image build stage
//!
//! Builds the runtime image from a fresh container of the pinned base:
//! source copy, native library, dependency manager and the `main`
//! dependency group. Tags are derived from the lock file digest and are
//! only written by the final commit step.

use crate::core::config::PipelineConfig;
use crate::core::{Pipeline, Step, StepAction};
use crate::error::{FailureKind, PipelineError};
use crate::execution::concurrency::ConcurrencyBackend;
use crate::execution::engine::{ExecutionEngine, ExecutionEvent, Stage};
use crate::runner::{ContainerSpec, ImageRef, Runtime};
use crate::stages::native::{native_steps, NativeArchive};
use crate::stages::resolver::{resolver_steps, DependencyGroups, LockState};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Label carrying the full lock file digest
pub const LOCK_DIGEST_LABEL: &str = "org.docs-pipeline.lock-digest";

/// Label naming the native library build
pub const NATIVE_LABEL: &str = "org.docs-pipeline.native";

/// Result of a successful image build
#[derive(Debug, Clone)]
pub struct ImageReport {
    pub run_id: Uuid,
    /// Content-addressed tag for the lock state
    pub image: ImageRef,
    /// Every tag written
    pub tags: Vec<ImageRef>,
    pub lock: LockState,
}

/// Tags written for a lock state
pub fn image_tags(config: &PipelineConfig, lock: &LockState) -> Vec<ImageRef> {
    vec![
        ImageRef::for_lock(&config.image.name, &lock.digest),
        ImageRef::latest(&config.image.name),
    ]
}

/// Plan the image build.
///
/// `container_path` maps a path inside the build container to the form
/// commands see; it is the identity for real containers.
pub fn plan_image(
    config: &PipelineConfig,
    lock: &LockState,
    container_path: &dyn Fn(&str) -> String,
) -> Result<Pipeline, PipelineError> {
    let archive = NativeArchive::from_config(config).map_err(|e| PipelineError::Config(e.to_string()))?;
    let tags = image_tags(config, lock);

    let mut variables: HashMap<String, String> = config.base_variables();
    variables.insert("workdir".to_string(), container_path(&config.image.workdir));
    variables.insert("native.src".to_string(), container_path(&archive.source_dir()));
    variables.insert("native.archive".to_string(), container_path(&archive.staged_path()));
    variables.insert("groups".to_string(), DependencyGroups::main_only().as_arg());

    let mut steps = vec![Step::new(
        "copy-source",
        "Copy source tree",
        StepAction::CopyIn {
            from: config.image.source.to_string_lossy().to_string(),
            to: config.image.workdir.clone(),
        },
    )];
    steps.extend(native_steps(config, &archive));
    steps.extend(resolver_steps(&config.image.resolver));

    let labels = BTreeMap::from([
        (LOCK_DIGEST_LABEL.to_string(), lock.digest.to_string()),
        (
            NATIVE_LABEL.to_string(),
            format!("{}-{}", archive.name, archive.version),
        ),
    ]);
    steps.push(Step::new(
        "commit-image",
        "Commit image",
        StepAction::Commit {
            tags: tags.clone(),
            labels,
            cmd: config.image.cmd.clone(),
        },
    ));

    if config.image.push {
        steps.push(
            Step::new("push-image", "Push image", StepAction::Push { tags })
                .with_failure_kind(FailureKind::Fetch),
        );
    }

    Ok(Pipeline::new(format!("{}-image", config.name), variables, steps))
}

/// Runs the image build stage
pub struct ImageBuilder {
    config: Arc<PipelineConfig>,
    runtime: Runtime,
    engine: Arc<ExecutionEngine>,
    concurrency: Arc<dyn ConcurrencyBackend>,
}

impl ImageBuilder {
    pub fn new(
        config: Arc<PipelineConfig>,
        runtime: Runtime,
        engine: Arc<ExecutionEngine>,
        concurrency: Arc<dyn ConcurrencyBackend>,
    ) -> Self {
        Self {
            config,
            runtime,
            engine,
            concurrency,
        }
    }

    /// Build and tag the image.
    ///
    /// Builds are serialized by the image concurrency group. The build
    /// container is removed whatever the outcome.
    pub async fn build(&self, run_id: Uuid) -> Result<ImageReport, PipelineError> {
        let lock = LockState::read(&self.config.lock_file_path())?;
        info!(
            "Building image for lock digest {} ({})",
            lock.digest.short(12),
            lock.path.display()
        );

        let ticket = self
            .concurrency
            .enqueue(&self.config.image.concurrency.group, run_id)?;
        let _permit = ticket.wait_turn().await?;

        let name = format!("docs-pipeline-image-{}", run_id.simple());
        let spec = ContainerSpec::new(name, self.config.image.base.clone(), self.config.image.workdir.clone());
        let container = self.runtime.start(spec).await?;

        let planned = plan_image(&self.config, &lock, &|path| container.path(path));
        let outcome = match planned {
            Ok(mut pipeline) => {
                pipeline.state.execution_id = run_id;
                self.engine
                    .execute(Stage::Image, &mut pipeline, &container)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = container.remove().await {
            warn!("Failed to remove build container: {}", e);
        }
        outcome?;

        let tags = image_tags(&self.config, &lock);
        for tag in &tags {
            self.engine.events().emit(ExecutionEvent::ImageTagged {
                run_id,
                image: tag.clone(),
            });
        }

        Ok(ImageReport {
            run_id,
            image: tags[0].clone(),
            tags,
            lock,
        })
    }
}
