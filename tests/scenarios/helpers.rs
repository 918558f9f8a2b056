//! Test fixtures for the scenario tests
//!
//! Scenarios run on the host runtime with real `sh`, so commands do what
//! they say; the runner records every command and can be scripted to fail.

use async_trait::async_trait;
use docs_pipeline::core::config::PipelineConfig;
use docs_pipeline::core::permissions::IdentityToken;
use docs_pipeline::digest::hash_bytes;
use docs_pipeline::execution::{
    ConcurrencyGroups, Dispatcher, EventBus, ExecutionEngine, ExecutionEvent, StepExecutor,
};
use docs_pipeline::persistence::{InMemoryPersistence, PersistenceBackend};
use docs_pipeline::runner::{
    CommandOutput, CommandRunner, CommandSpec, Runtime, RunnerError, RuntimeKind, ShellRunner,
};
use docs_pipeline::stages::artifact::{Artifact, ArtifactStore};
use docs_pipeline::stages::image::ImageReport;
use docs_pipeline::stages::native::{ArchiveFetcher, FetchError};
use docs_pipeline::stages::publish::Publisher;
use docs_pipeline::stages::target::{DeployError, DeployReceipt, DeployTarget, DirectoryTarget};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Records commands and runs them with `sh`, unless told to fail them
#[derive(Default)]
pub struct MockRunner {
    commands: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, i32, String)>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any command whose rendered line contains `pattern`
    pub fn fail_on(&self, pattern: &str, code: i32) {
        self.fail_with(pattern, code, "scripted failure");
    }

    /// Like `fail_on`, with the given stderr
    pub fn fail_with(&self, pattern: &str, code: i32, stderr: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), code, stderr.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.commands().iter().any(|c| c.contains(pattern))
    }

    pub fn clear(&self) {
        self.commands.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        let line = spec.display();
        self.commands.lock().unwrap().push(line.clone());

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _, _)| line.contains(pattern.as_str()))
            .map(|(_, code, stderr)| (*code, stderr.clone()));
        if let Some((code, stderr)) = failure {
            return Err(RunnerError::Exit {
                command: line,
                code,
                stderr,
            });
        }

        ShellRunner::new().run(spec).await
    }
}

/// Serves one archive body for every URL
pub struct MockFetcher {
    body: Mutex<Vec<u8>>,
    status: Mutex<u16>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Mutex::new(body),
            status: Mutex::new(200),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn respond_with_status(&self, status: u16) {
        *self.status.lock().unwrap() = status;
    }

    pub fn serve(&self, body: Vec<u8>) {
        *self.body.lock().unwrap() = body;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = *self.status.lock().unwrap();
        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(self.body.lock().unwrap().clone())
    }
}

/// Directory target that records deployments and how many overlapped
pub struct RecordingTarget {
    inner: DirectoryTarget,
    delay: Duration,
    fail: AtomicBool,
    active: AtomicUsize,
    max_active: AtomicUsize,
    configured: AtomicUsize,
    deployed: Mutex<Vec<Uuid>>,
}

impl RecordingTarget {
    pub fn new(path: PathBuf, delay: Duration) -> Self {
        Self {
            inner: DirectoryTarget::new(path),
            delay,
            fail: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            configured: AtomicUsize::new(0),
            deployed: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_deploys(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn deployed(&self) -> Vec<Uuid> {
        self.deployed.lock().unwrap().clone()
    }

    pub fn configured(&self) -> usize {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeployTarget for RecordingTarget {
    fn describe(&self) -> String {
        format!("recording {}", self.inner.describe())
    }

    async fn configure(&self, token: &IdentityToken) -> Result<(), DeployError> {
        self.configured.fetch_add(1, Ordering::SeqCst);
        self.inner.configure(token).await
    }

    async fn deploy(&self, artifact: &Artifact, token: &IdentityToken) -> Result<DeployReceipt, DeployError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = Active(&self.active);
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let result = if self.fail.load(Ordering::SeqCst) {
            Err(DeployError::InvalidTarget("target rejected the upload".to_string()))
        } else {
            self.inner.deploy(artifact, token).await
        };
        if result.is_ok() {
            self.deployed.lock().unwrap().push(artifact.run_id);
        }
        result
    }
}

/// Counts a deploy as finished even when its future is dropped
struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub type EventLog = Arc<Mutex<Vec<ExecutionEvent>>>;

/// Gzip tarball laid out like an upstream source release
pub fn native_archive() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append(
        &mut builder,
        "ta-lib-0.4.0/configure",
        0o755,
        b"#!/bin/sh\necho \"prefix=$1\" > configured.txt\n",
    );
    append(&mut builder, "ta-lib-0.4.0/README", 0o644, b"TA-Lib sources\n");
    builder.into_inner().unwrap().finish().unwrap()
}

fn append(builder: &mut tar::Builder<GzEncoder<Vec<u8>>>, path: &str, mode: u32, body: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, path, body).unwrap();
}

const PIPELINE_YAML: &str = r#"
name: "tradepy-docs"
runtime: host
triggers:
  push:
    branches: ["main", "release/*"]
  manual: true
image:
  name: "tradepy"
  base: "python:3.11-slim"
  workdir: "/app"
  source: "__SOURCE__"
  native:
    name: "ta-lib"
    version: "0.4.0"
    url: "https://downloads.example.com/ta-lib-{{ version }}-src.tar.gz"
    sha256: "__SHA256__"
    configure: "sh ./configure /usr"
    compile: "echo compiled > built.txt"
    install: "cp built.txt configured.txt {{ workdir }}/"
  resolver:
    install: "echo poetry > resolver.txt"
    command: "echo installing {{ groups }}"
docs:
  flag:
    name: "BUILD_DOCS"
  groups: ["doc"]
  generator: "mkdir -p {{ output_dir }} && echo \"<h1>{{ revision }} docs=$BUILD_DOCS</h1>\" > {{ output_dir }}/index.html"
  output_dir: "site"
publish:
  target:
    kind: directory
    path: "__PUBLIC__"
  artifact_dir: "__ARTIFACTS__"
"#;

/// A source tree, a host runtime state directory and the mocks around them
pub struct Fixture {
    pub dir: TempDir,
    pub runner: Arc<MockRunner>,
    pub fetcher: Arc<MockFetcher>,
    pub target: Arc<RecordingTarget>,
    pub concurrency: Arc<ConcurrencyGroups>,
    pub history: Arc<InMemoryPersistence>,
    pub events: EventBus,
    pub log: EventLog,
    archive_sha: String,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_deploy_delay(Duration::from_millis(0))
    }

    pub fn with_deploy_delay(delay: Duration) -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("docs")).unwrap();
        std::fs::write(source.join("poetry.lock"), "[[package]]\nname = \"pandas\"\n").unwrap();
        std::fs::write(source.join("pyproject.toml"), "[tool.poetry]\nname = \"tradepy\"\n").unwrap();
        std::fs::write(source.join("docs/index.md"), "# tradepy\n").unwrap();
        std::fs::create_dir_all(source.join(".git")).unwrap();
        std::fs::write(source.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::create_dir_all(source.join("site")).unwrap();
        std::fs::write(source.join("site/stale.html"), "left over from a local build\n").unwrap();

        let archive = native_archive();
        let archive_sha = hash_bytes(&archive).to_string();

        let events = EventBus::new();
        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        events.subscribe(move |event| sink.lock().unwrap().push(event));

        Self {
            target: Arc::new(RecordingTarget::new(dir.path().join("public"), delay)),
            dir,
            runner: Arc::new(MockRunner::new()),
            fetcher: Arc::new(MockFetcher::new(archive)),
            concurrency: Arc::new(ConcurrencyGroups::new()),
            history: Arc::new(InMemoryPersistence::new()),
            events,
            log,
            archive_sha,
        }
    }

    pub fn source(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub fn public(&self) -> PathBuf {
        self.dir.path().join("public")
    }

    pub fn artifacts(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }

    pub fn state(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn workspaces(&self) -> PathBuf {
        self.dir.path().join("workspaces")
    }

    pub fn write_lock(&self, content: &str) {
        std::fs::write(self.source().join("poetry.lock"), content).unwrap();
    }

    pub fn config(&self) -> PipelineConfig {
        let yaml = PIPELINE_YAML
            .replace("__SOURCE__", &path_str(&self.source()))
            .replace("__SHA256__", &self.archive_sha)
            .replace("__PUBLIC__", &path_str(&self.public()))
            .replace("__ARTIFACTS__", &path_str(&self.artifacts()));
        PipelineConfig::from_yaml(&yaml).unwrap()
    }

    pub fn runtime(&self) -> Runtime {
        Runtime::new(RuntimeKind::Host, self.runner.clone(), self.state())
    }

    /// Docker runtime driven through the recording runner
    pub fn docker_runtime(&self) -> Runtime {
        Runtime::new(RuntimeKind::Docker, self.runner.clone(), self.state())
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        Arc::new(ExecutionEngine::new(
            StepExecutor::new(self.fetcher.clone(), self.dir.path().join("downloads")),
            self.events.clone(),
        ))
    }

    /// Dispatcher publishing to the recording target
    pub fn dispatcher(&self, config: PipelineConfig, flag: Option<&str>) -> Dispatcher {
        self.dispatcher_with_target(config, flag, self.target.clone())
    }

    pub fn dispatcher_with_target(
        &self,
        config: PipelineConfig,
        flag: Option<&str>,
        target: Arc<dyn DeployTarget>,
    ) -> Dispatcher {
        let config = Arc::new(config);
        let engine = self.engine();
        let publisher = Publisher::new(
            config.permissions.clone(),
            ArtifactStore::new(self.artifacts()),
            target,
            self.events.clone(),
        );

        let env: HashMap<String, String> = flag
            .map(|value| HashMap::from([("BUILD_DOCS".to_string(), value.to_string())]))
            .unwrap_or_default();
        let history: Arc<dyn PersistenceBackend> = self.history.clone();

        Dispatcher::new(
            config,
            self.runtime(),
            engine,
            self.concurrency.clone(),
            publisher,
            self.workspaces(),
        )
        .with_env(Arc::new(move |name: &str| env.get(name).cloned()))
        .with_history(history)
    }

    /// Build the image for the current lock file, then forget its commands
    /// and events
    pub async fn build_image(&self) -> ImageReport {
        let report = self
            .dispatcher(self.config(), None)
            .build_image(Uuid::new_v4())
            .await
            .unwrap();
        self.runner.clear();
        self.log.lock().unwrap().clear();
        report
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.log.lock().unwrap().clone()
    }

    /// Ids of the steps reported skipped, in order
    pub fn skipped_steps(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ExecutionEvent::StepSkipped { step_id, .. } => Some(step_id),
                _ => None,
            })
            .collect()
    }

    pub fn live_page(&self) -> String {
        std::fs::read_to_string(self.public().join("index.html")).unwrap()
    }
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Entries directly under `dir`; zero when it does not exist
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
