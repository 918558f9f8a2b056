//! Container runtime - job containers driven through the docker CLI, or
//! emulated on the host for local runs

use crate::digest::ContentHash;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError};
use crate::tree::copy_tree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which runtime executes job containers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Real containers through the docker CLI
    #[default]
    Docker,
    /// Commands run directly on the host; container paths are mapped into a
    /// state directory
    Host,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Host => "host",
        })
    }
}

/// A registry reference `name:tag`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Tag derived from the lock file digest; identical lock files map to the
    /// same tag, so concurrent builds of one lock state write identical images
    pub fn for_lock(name: &str, lock_digest: &ContentHash) -> Self {
        Self::new(name, format!("lock-{}", lock_digest.short(12)))
    }

    pub fn latest(name: &str) -> Self {
        Self::new(name, "latest")
    }

    /// Parse `name[:tag]`, where a registry port is not mistaken for a tag
    pub fn parse(reference: &str) -> Self {
        match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => Self::new(name, tag),
            _ => Self::new(reference, "latest"),
        }
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// How to start a job container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, unique per run
    pub name: String,

    /// Image to start from
    pub image: String,

    /// Working directory inside the container
    pub workdir: String,

    /// Host directory → container path bind mounts
    pub mounts: Vec<(PathBuf, String)>,

    /// Environment exported to every command
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            workdir: workdir.into(),
            mounts: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn mount(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.mounts.push((host.into(), container.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Registry replies meaning the image does not exist
const MISSING_IMAGE_MARKERS: [&str; 4] = [
    "manifest unknown",
    "not found",
    "does not exist",
    "pull access denied",
];

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    MISSING_IMAGE_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Metadata written for each committed image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image: ImageRef,
    pub workdir: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Entry point for image and container operations
#[derive(Clone)]
pub struct Runtime {
    kind: RuntimeKind,
    runner: Arc<dyn CommandRunner>,
    docker: String,
    state_dir: PathBuf,
}

impl Runtime {
    /// Create a runtime
    ///
    /// `state_dir` holds the host runtime's container roots and image records;
    /// the docker runtime ignores it.
    pub fn new(kind: RuntimeKind, runner: Arc<dyn CommandRunner>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            runner,
            docker: "docker".to_string(),
            state_dir: state_dir.into(),
        }
    }

    /// Use a different docker-compatible CLI (e.g. `podman`)
    pub fn with_docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker = binary.into();
        self
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    fn docker(&self) -> CommandSpec {
        CommandSpec::new(self.docker.clone())
    }

    fn image_record_path(&self, image: &ImageRef) -> PathBuf {
        self.state_dir
            .join("images")
            .join(image.name.replace('/', "_"))
            .join(format!("{}.json", image.tag))
    }

    /// Check whether an image is available locally
    pub async fn image_exists(&self, image: &ImageRef) -> Result<bool, RunnerError> {
        match self.kind {
            RuntimeKind::Docker => {
                let spec = self
                    .docker()
                    .args(["image", "inspect", "--format", "{{.Id}}"])
                    .arg(image.to_string());
                match self.runner.run(&spec).await {
                    Ok(_) => Ok(true),
                    Err(RunnerError::Exit { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }
            RuntimeKind::Host => Ok(self.image_record_path(image).exists()),
        }
    }

    /// Read back the record of a host-runtime image
    pub fn image_record(&self, image: &ImageRef) -> Result<Option<ImageRecord>, RunnerError> {
        let path = self.image_record_path(image);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| RunnerError::Runtime(format!("corrupt image record {}: {}", path.display(), e)))
    }

    /// Pull an image from its registry
    ///
    /// # Errors
    /// `RunnerError::ImageNotFound` when the registry answers that the image
    /// does not exist; any other error means the registry could not be asked.
    pub async fn pull(&self, image: &ImageRef) -> Result<(), RunnerError> {
        match self.kind {
            RuntimeKind::Docker => {
                let spec = self.docker().arg("pull").arg(image.to_string());
                match self.runner.run(&spec).await {
                    Ok(_) => Ok(()),
                    Err(RunnerError::Exit { stderr, .. }) if is_missing_image(&stderr) => {
                        Err(RunnerError::ImageNotFound(image.to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            RuntimeKind::Host => {
                if self.image_record_path(image).exists() {
                    Ok(())
                } else {
                    Err(RunnerError::ImageNotFound(image.to_string()))
                }
            }
        }
    }

    /// Push an image to its registry
    pub async fn push(&self, image: &ImageRef) -> Result<(), RunnerError> {
        match self.kind {
            RuntimeKind::Docker => {
                self.runner
                    .run(&self.docker().arg("push").arg(image.to_string()))
                    .await?;
            }
            RuntimeKind::Host => {
                debug!("Host runtime has no registry; {} stays local", image);
            }
        }
        Ok(())
    }

    /// Start a long-lived job container
    pub async fn start(&self, spec: ContainerSpec) -> Result<JobContainer, RunnerError> {
        info!("Starting job container {} from {}", spec.name, spec.image);

        let backend = match self.kind {
            RuntimeKind::Docker => {
                let mut command = self
                    .docker()
                    .args(["run", "--detach", "--name"])
                    .arg(&spec.name)
                    .arg("--workdir")
                    .arg(&spec.workdir);
                for (host, container) in &spec.mounts {
                    command = command
                        .arg("--volume")
                        .arg(format!("{}:{}", host.display(), container));
                }
                for (key, value) in &spec.env {
                    command = command.arg("--env").arg(format!("{}={}", key, value));
                }
                command = command
                    .args(["--entrypoint", "tail"])
                    .arg(&spec.image)
                    .args(["-f", "/dev/null"]);

                let output = self.runner.run(&command).await?;
                let id = output.stdout.trim().to_string();
                Backend::Docker {
                    id: if id.is_empty() { spec.name.clone() } else { id },
                }
            }
            RuntimeKind::Host => {
                let root = self.state_dir.join("containers").join(&spec.name);
                if root.exists() {
                    std::fs::remove_dir_all(&root)?;
                }
                std::fs::create_dir_all(&root)?;
                let container = Backend::Host {
                    root,
                    mounts: spec.mounts.clone(),
                };
                std::fs::create_dir_all(map_host_path(&container, &spec.workdir))?;
                container
            }
        };

        Ok(JobContainer {
            name: spec.name,
            workdir: spec.workdir,
            env: spec.env,
            backend,
            runtime: self.clone(),
            removed: false,
        })
    }
}

#[derive(Debug, Clone)]
enum Backend {
    Docker { id: String },
    Host { root: PathBuf, mounts: Vec<(PathBuf, String)> },
}

fn map_host_path(backend: &Backend, container_path: &str) -> PathBuf {
    match backend {
        Backend::Docker { .. } => PathBuf::from(container_path),
        Backend::Host { root, mounts } => {
            for (host, target) in mounts {
                if let Some(rest) = container_path.strip_prefix(target.as_str()) {
                    if rest.is_empty() || rest.starts_with('/') {
                        return host.join(rest.trim_start_matches('/'));
                    }
                }
            }
            root.join(container_path.trim_start_matches('/'))
        }
    }
}

/// A running job container
pub struct JobContainer {
    name: String,
    workdir: String,
    env: Vec<(String, String)>,
    backend: Backend,
    runtime: Runtime,
    removed: bool,
}

impl JobContainer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Translate a container path into the form commands should use
    pub fn path(&self, container_path: &str) -> String {
        map_host_path(&self.backend, container_path)
            .to_string_lossy()
            .to_string()
    }

    /// Run a shell script in the container's working directory
    pub async fn exec(&self, script: &str, env: &[(String, String)]) -> Result<CommandOutput, RunnerError> {
        let spec = match &self.backend {
            Backend::Docker { id } => {
                let mut command = self
                    .runtime
                    .docker()
                    .arg("exec")
                    .arg("--workdir")
                    .arg(&self.workdir);
                for (key, value) in env {
                    command = command.arg("--env").arg(format!("{}={}", key, value));
                }
                command.arg(id).args(["sh", "-c"]).arg(script)
            }
            Backend::Host { .. } => {
                let mut command = CommandSpec::shell(script).cwd(self.path(&self.workdir));
                for (key, value) in self.env.iter().chain(env) {
                    command = command.env(key, value);
                }
                command
            }
        };

        self.runtime.runner.run(&spec).await
    }

    /// Copy a host file or directory into the container
    ///
    /// Directories are copied by content, so `to` ends up mirroring `from`.
    pub async fn copy_in(&self, from: &Path, to: &str) -> Result<(), RunnerError> {
        match &self.backend {
            Backend::Docker { id } => {
                let source = if from.is_dir() {
                    format!("{}/.", from.display())
                } else {
                    from.display().to_string()
                };
                let spec = self
                    .runtime
                    .docker()
                    .arg("cp")
                    .arg(source)
                    .arg(format!("{}:{}", id, to));
                self.runtime.runner.run(&spec).await?;
            }
            Backend::Host { .. } => {
                let dest = map_host_path(&self.backend, to);
                if from.is_dir() {
                    copy_tree(from, &dest, &[])?;
                } else {
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(from, &dest)?;
                }
            }
        }
        Ok(())
    }

    /// Snapshot the container into one or more tags
    pub async fn commit(
        &self,
        tags: &[ImageRef],
        labels: &BTreeMap<String, String>,
        cmd: &[String],
    ) -> Result<(), RunnerError> {
        let Some(primary) = tags.first() else {
            return Err(RunnerError::Runtime("commit needs at least one tag".to_string()));
        };

        match &self.backend {
            Backend::Docker { id } => {
                let mut command = self
                    .runtime
                    .docker()
                    .arg("commit")
                    .arg("--change")
                    .arg(format!("WORKDIR {}", self.workdir))
                    .arg("--change")
                    .arg("ENTRYPOINT []");
                if !cmd.is_empty() {
                    let cmd_json = serde_json::to_string(cmd)
                        .map_err(|e| RunnerError::Runtime(e.to_string()))?;
                    command = command.arg("--change").arg(format!("CMD {}", cmd_json));
                }
                for (key, value) in labels {
                    command = command.arg("--change").arg(format!("LABEL {}={}", key, value));
                }
                command = command.arg(id).arg(primary.to_string());
                self.runtime.runner.run(&command).await?;

                for tag in &tags[1..] {
                    let alias = self
                        .runtime
                        .docker()
                        .arg("tag")
                        .arg(primary.to_string())
                        .arg(tag.to_string());
                    self.runtime.runner.run(&alias).await?;
                }
            }
            Backend::Host { .. } => {
                for tag in tags {
                    let record = ImageRecord {
                        image: tag.clone(),
                        workdir: self.workdir.clone(),
                        labels: labels.clone(),
                        created_at: Utc::now(),
                    };
                    let path = self.runtime.image_record_path(tag);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let json = serde_json::to_string_pretty(&record)
                        .map_err(|e| RunnerError::Runtime(e.to_string()))?;
                    std::fs::write(path, json)?;
                }
            }
        }

        info!("Committed {} ({} tags)", primary, tags.len());
        Ok(())
    }

    /// Stop and delete the container
    pub async fn remove(mut self) -> Result<(), RunnerError> {
        self.removed = true;
        match &self.backend {
            Backend::Docker { id } => {
                let spec = self.runtime.docker().args(["rm", "--force"]).arg(id);
                self.runtime.runner.run(&spec).await?;
            }
            Backend::Host { root, .. } => {
                if let Err(e) = std::fs::remove_dir_all(root) {
                    warn!("Failed to clean container root {}: {}", root.display(), e);
                }
            }
        }
        debug!("Removed job container {}", self.name);
        Ok(())
    }
}

impl Drop for JobContainer {
    /// Containers abandoned by a cancelled job (e.g. on timeout) are removed
    /// in the background
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match &self.backend {
            Backend::Docker { id } => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    warn!("Job container {} left running", self.name);
                    return;
                };
                let runner = self.runtime.runner.clone();
                let spec = self.runtime.docker().args(["rm", "--force"]).arg(id);
                handle.spawn(async move {
                    if let Err(e) = runner.run(&spec).await {
                        warn!("Failed to remove abandoned container: {}", e);
                    }
                });
            }
            Backend::Host { root, .. } => {
                let _ = std::fs::remove_dir_all(root);
            }
        }
    }
}
