//! Documentation build stage
//!
//! Runs inside the image built for the current lock file. The docs flag
//! decides whether the doc dependency groups are installed on top of `main`;
//! the site generator runs either way and must leave a non-empty output
//! directory behind.

use crate::core::config::PipelineConfig;
use crate::core::{PhaseTracker, Pipeline, RunPhase, Step};
use crate::digest::{hash_directory, ContentHash};
use crate::error::{FailureKind, PipelineError};
use crate::execution::engine::{EventBus, ExecutionEngine, ExecutionEvent, Stage};
use crate::runner::{ContainerSpec, ImageRef, JobContainer, Runtime, RunnerError};
use crate::stages::resolver::{DependencyGroups, LockState};
use crate::tree::is_non_empty_dir;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Values of the docs flag that enable the doc toolchain
const TRUTHY: [&str; 4] = ["1", "true", "yes", "on"];

/// Whether a flag value enables the doc toolchain
pub fn parse_flag(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    TRUTHY.contains(&value.as_str())
}

/// Resolve the docs flag from `env`, falling back to the configured default
pub fn docs_flag_enabled(config: &PipelineConfig, env: &dyn Fn(&str) -> Option<String>) -> bool {
    let flag = &config.docs.flag;
    env(&flag.name)
        .or_else(|| flag.default.clone())
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

/// Dependency groups for a docs build
pub fn doc_groups(config: &PipelineConfig, enabled: bool) -> DependencyGroups {
    if enabled {
        DependencyGroups::with(config.docs.groups.iter().cloned())
    } else {
        DependencyGroups::main_only()
    }
}

/// Per-run information passed to the generator
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub revision: Option<String>,
    pub branch: Option<String>,
}

/// Plan the docs build steps
pub fn plan_docs(config: &PipelineConfig, groups: &DependencyGroups, run: &RunInfo, workdir: &str) -> Pipeline {
    let mut variables: HashMap<String, String> = config.base_variables();
    variables.insert("workdir".to_string(), workdir.to_string());
    variables.insert("groups".to_string(), groups.as_arg());
    variables.insert("output_dir".to_string(), config.docs.output_dir.clone());
    variables.insert("run_id".to_string(), run.run_id.to_string());
    variables.insert("revision".to_string(), run.revision.clone().unwrap_or_default());
    variables.insert("branch".to_string(), run.branch.clone().unwrap_or_default());

    let steps = vec![
        Step::exec(
            "install-groups",
            format!("Install dependency groups ({})", groups),
            config.image.resolver.command.clone(),
        ),
        Step::exec("generate", "Generate site", config.docs.generator.clone())
            .with_failure_kind(FailureKind::Generator),
    ];

    Pipeline::new(format!("{}-docs", config.name), variables, steps)
}

/// The generator's output for one run.
///
/// Only the docs stage can produce one, so publishing always follows a
/// successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    run_id: Uuid,
    site_dir: PathBuf,
    digest: ContentHash,
    image: ImageRef,
    groups: DependencyGroups,
}

impl BuildOutput {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn site_dir(&self) -> &Path {
        &self.site_dir
    }

    /// Digest of the output tree
    pub fn digest(&self) -> &ContentHash {
        &self.digest
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn groups(&self) -> &DependencyGroups {
        &self.groups
    }

    #[cfg(test)]
    pub(crate) fn for_tests(run_id: Uuid, site_dir: PathBuf) -> Self {
        let digest = hash_directory(&site_dir).unwrap_or_else(|_| ContentHash(String::new()));
        Self {
            run_id,
            site_dir,
            digest,
            image: ImageRef::latest("test"),
            groups: DependencyGroups::main_only(),
        }
    }
}

/// Runs the documentation build stage
pub struct DocsBuilder {
    config: Arc<PipelineConfig>,
    runtime: Runtime,
    engine: Arc<ExecutionEngine>,
}

impl DocsBuilder {
    pub fn new(config: Arc<PipelineConfig>, runtime: Runtime, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            config,
            runtime,
            engine,
        }
    }

    fn events(&self) -> &EventBus {
        self.engine.events()
    }

    fn advance(&self, tracker: &mut PhaseTracker, run_id: Uuid, phase: RunPhase) -> Result<(), PipelineError> {
        tracker.advance(phase)?;
        self.events().emit(ExecutionEvent::PhaseChanged { run_id, phase });
        Ok(())
    }

    /// Find the image to build in; never builds one
    pub async fn resolve_image(&self, lock: &LockState) -> Result<ImageRef, PipelineError> {
        let expected = ImageRef::for_lock(&self.config.image.name, &lock.digest);
        if self.image_available(&expected).await? {
            return Ok(expected);
        }

        if self.config.docs.allow_stale_image {
            let latest = ImageRef::latest(&self.config.image.name);
            if self.image_available(&latest).await? {
                warn!(
                    "No image for lock digest {}; falling back to {}",
                    lock.digest.short(12),
                    latest
                );
                return Ok(latest);
            }
        }

        Err(PipelineError::StaleImage {
            expected: expected.to_string(),
            digest: lock.digest.to_string(),
        })
    }

    /// Local or pullable; an unreachable registry is an error, not absence
    async fn image_available(&self, image: &ImageRef) -> Result<bool, PipelineError> {
        if self.runtime.image_exists(image).await? {
            return Ok(true);
        }
        match self.runtime.pull(image).await {
            Ok(()) => Ok(true),
            Err(RunnerError::ImageNotFound(_)) => Ok(false),
            Err(source) => Err(PipelineError::Pull {
                image: image.to_string(),
                source,
            }),
        }
    }

    /// Build the site for a checked-out `workspace`.
    ///
    /// Drives the run through Provisioning and Building to BuildComplete;
    /// the caller moves it to Failed on error.
    pub async fn build(
        &self,
        workspace: &Path,
        run: &RunInfo,
        flag_enabled: bool,
        tracker: &mut PhaseTracker,
    ) -> Result<BuildOutput, PipelineError> {
        let run_id = run.run_id;
        self.advance(tracker, run_id, RunPhase::Provisioning)?;

        let lock = LockState::read(&workspace.join(&self.config.image.resolver.lock_file))?;
        let image = self.resolve_image(&lock).await?;
        let groups = doc_groups(&self.config, flag_enabled);
        info!("Building docs in {} with groups {}", image, groups);

        let flag = &self.config.docs.flag;
        let spec = ContainerSpec::new(
            format!("docs-pipeline-docs-{}", run_id.simple()),
            image.to_string(),
            self.config.image.workdir.clone(),
        )
        .mount(workspace, self.config.image.workdir.clone())
        .env(flag.name.clone(), if flag_enabled { "1" } else { "0" });
        let container = self.runtime.start(spec).await?;

        let mut pipeline = plan_docs(
            &self.config,
            &groups,
            run,
            &container.path(&self.config.image.workdir),
        );
        pipeline.state.execution_id = run_id;

        let outcome = self.run_steps(pipeline, &container, tracker, run_id).await;
        if let Err(e) = container.remove().await {
            warn!("Failed to remove docs container: {}", e);
        }
        outcome?;

        let site_dir = workspace.join(&self.config.docs.output_dir);
        if !is_non_empty_dir(&site_dir) {
            return Err(PipelineError::EmptyOutput(site_dir.display().to_string()));
        }
        let digest = hash_directory(&site_dir)?;

        self.advance(tracker, run_id, RunPhase::BuildComplete)?;
        Ok(BuildOutput {
            run_id,
            site_dir,
            digest,
            image,
            groups,
        })
    }

    /// Install groups while provisioning, then generate while building
    async fn run_steps(
        &self,
        mut pipeline: Pipeline,
        container: &JobContainer,
        tracker: &mut PhaseTracker,
        run_id: Uuid,
    ) -> Result<(), PipelineError> {
        let generate = pipeline.steps.split_off(1);
        self.engine.execute(Stage::Docs, &mut pipeline, container).await?;

        self.advance(tracker, run_id, RunPhase::Building)?;
        let mut building = Pipeline::new(pipeline.name.clone(), pipeline.variables.clone(), generate);
        building.state.execution_id = run_id;
        self.engine.execute(Stage::Docs, &mut building, container).await
    }
}
