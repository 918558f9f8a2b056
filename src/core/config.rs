//! Pipeline configuration from YAML

use crate::core::context::{placeholders, PipelineContext, TemplateError};
use crate::core::permissions::Permissions;
use crate::core::trigger::TriggerConfig;
use crate::digest::is_sha256_hex;
use crate::runner::{ImageRef, RuntimeKind};
use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Where job containers run
    #[serde(default)]
    pub runtime: RuntimeKind,

    /// Global variables available to every command as `{{ key }}`
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Events that start a documentation run
    #[serde(default)]
    pub triggers: TriggerConfig,

    /// Capabilities granted to runs
    #[serde(default)]
    pub permissions: Permissions,

    #[serde(default)]
    pub defaults: Defaults,

    pub image: ImageConfig,

    #[serde(default)]
    pub docs: DocsConfig,

    pub publish: PublishConfig,
}

/// Settings shared by all jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    /// Job timeout; a hung step blocks its job until this fires
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

fn default_timeout_minutes() -> u64 {
    360
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

/// Image build stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Image repository name, e.g. `ghcr.io/acme/tradepy`
    pub name: String,

    /// Version-pinned base runtime image
    pub base: String,

    /// Working directory inside the image
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Source tree copied into the workdir (relative to the config file)
    #[serde(default = "default_source")]
    pub source: PathBuf,

    /// Push tags to the registry after committing
    #[serde(default)]
    pub push: bool,

    /// Default command recorded in the image
    #[serde(default = "default_cmd")]
    pub cmd: Vec<String>,

    /// Serializes image builds that would write the same tags
    #[serde(default = "default_image_concurrency")]
    pub concurrency: ConcurrencyConfig,

    pub native: NativeConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,
}

fn default_workdir() -> String {
    "/app".to_string()
}

fn default_source() -> PathBuf {
    PathBuf::from(".")
}

fn default_cmd() -> Vec<String> {
    vec!["python3".to_string()]
}

fn default_image_concurrency() -> ConcurrencyConfig {
    ConcurrencyConfig {
        group: "image".to_string(),
        cancel_in_progress: false,
    }
}

/// Native library built from a source archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    pub name: String,

    pub version: String,

    /// Archive URL; may reference `{{ version }}` and `{{ name }}`
    pub url: String,

    /// Expected SHA-256 of the archive
    pub sha256: String,

    #[serde(default = "default_configure")]
    pub configure: String,

    #[serde(default = "default_compile")]
    pub compile: String,

    #[serde(default = "default_install")]
    pub install: String,
}

fn default_configure() -> String {
    "./configure --prefix=/usr".to_string()
}

fn default_compile() -> String {
    "make".to_string()
}

fn default_install() -> String {
    "make install".to_string()
}

/// Dependency manager invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Installs the dependency manager itself
    #[serde(default = "default_resolver_install")]
    pub install: String,

    /// Lock file, relative to the source tree
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Install command; `{{ groups }}` becomes e.g. `main,doc`
    #[serde(default = "default_resolver_command")]
    pub command: String,

    /// Alternate package index
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
}

fn default_resolver_install() -> String {
    "pip install --no-cache-dir poetry && poetry config virtualenvs.create false".to_string()
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("poetry.lock")
}

fn default_resolver_command() -> String {
    "poetry install --no-interaction --no-root --only {{ groups }}".to_string()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            install: default_resolver_install(),
            lock_file: default_lock_file(),
            command: default_resolver_command(),
            mirror: None,
        }
    }
}

/// Package index mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub url: String,

    /// Trust the mirror host even without valid TLS
    #[serde(default)]
    pub trusted: bool,
}

/// Documentation build stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocsConfig {
    #[serde(default)]
    pub flag: DocsFlagConfig,

    /// Groups installed on top of `main` when the flag is on
    #[serde(default = "default_doc_groups")]
    pub groups: Vec<String>,

    /// Site generator command; may reference `{{ output_dir }}`
    #[serde(default = "default_generator")]
    pub generator: String,

    /// Generator output, relative to the workdir
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Fall back to `latest` when no image matches the current lock file
    #[serde(default)]
    pub allow_stale_image: bool,
}

fn default_doc_groups() -> Vec<String> {
    vec!["doc".to_string()]
}

fn default_generator() -> String {
    "mkdocs build --clean --site-dir {{ output_dir }}".to_string()
}

fn default_output_dir() -> String {
    "site".to_string()
}

impl Default for DocsConfig {
    fn default() -> Self {
        Self {
            flag: DocsFlagConfig::default(),
            groups: default_doc_groups(),
            generator: default_generator(),
            output_dir: default_output_dir(),
            allow_stale_image: false,
        }
    }
}

/// Environment flag selecting whether the doc toolchain is installed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocsFlagConfig {
    #[serde(default = "default_flag_name")]
    pub name: String,

    /// Value used when the variable is not set in the environment
    #[serde(default)]
    pub default: Option<String>,
}

fn default_flag_name() -> String {
    "BUILD_DOCS".to_string()
}

impl Default for DocsFlagConfig {
    fn default() -> Self {
        Self {
            name: default_flag_name(),
            default: Some("1".to_string()),
        }
    }
}

/// Publish stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_pages_concurrency")]
    pub concurrency: ConcurrencyConfig,

    pub target: TargetConfig,

    /// Where uploaded artifacts are kept (defaults to the data directory)
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
}

fn default_pages_concurrency() -> ConcurrencyConfig {
    ConcurrencyConfig {
        group: "pages".to_string(),
        cancel_in_progress: false,
    }
}

/// A named concurrency group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub group: String,

    /// Must stay false: queued runs wait, in-flight runs are never cancelled
    #[serde(default)]
    pub cancel_in_progress: bool,
}

/// Hosting target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetConfig {
    /// Serve from a local directory, swapped in atomically
    Directory { path: PathBuf },

    /// Hand the artifact to external commands
    Command {
        #[serde(default)]
        configure: Option<String>,
        deploy: String,
    },
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    ///
    /// Relative paths in the file are resolved against its directory.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Make relative paths absolute against `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.image.source.is_relative() {
            self.image.source = base.join(&self.image.source);
        }
        if let TargetConfig::Directory { path } = &mut self.publish.target {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if let Some(dir) = &mut self.publish.artifact_dir {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Path of the lock file inside the source tree
    pub fn lock_file_path(&self) -> PathBuf {
        self.image.source.join(&self.image.resolver.lock_file)
    }

    /// Variables every command can use
    pub fn base_variables(&self) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.insert("workdir".to_string(), self.image.workdir.clone());
        vars.insert("image.name".to_string(), self.image.name.clone());
        vars.insert("native.name".to_string(), self.image.native.name.clone());
        vars.insert("native.version".to_string(), self.image.native.version.clone());
        vars
    }

    /// Archive URL with `{{ version }}` and `{{ name }}` filled in
    pub fn native_url(&self) -> Result<String, TemplateError> {
        let native = &self.image.native;
        let mut context = PipelineContext::new();
        context.variables.extend(self.base_variables());
        context.set_variable("version", native.version.clone());
        context.set_variable("name", native.name.clone());
        context.render(&native.url)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }

        self.permissions
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid permissions: {}", e))?;

        if self.triggers.push.is_none() && !self.triggers.manual {
            anyhow::bail!("At least one trigger (push or manual) must be enabled");
        }
        if let Some(push) = &self.triggers.push {
            if push.branches.is_empty() || push.branches.iter().any(|b| b.trim().is_empty()) {
                anyhow::bail!("Push trigger needs at least one non-empty branch pattern");
            }
        }

        if self.defaults.timeout_minutes == 0 {
            anyhow::bail!("defaults.timeout_minutes must be greater than zero");
        }

        self.validate_image()?;
        self.validate_docs()?;
        self.validate_publish()?;
        self.check_placeholders()?;

        Ok(())
    }

    fn validate_image(&self) -> Result<()> {
        let image = &self.image;

        if image.name.trim().is_empty() {
            anyhow::bail!("image.name must not be empty");
        }

        let base = ImageRef::parse(&image.base);
        let pinned = image.base.contains('@') || (image.base.contains(':') && base.tag != "latest");
        if !pinned || base.tag == "latest" {
            anyhow::bail!(
                "image.base '{}' must be pinned to a version tag or digest",
                image.base
            );
        }

        if !image.workdir.starts_with('/') {
            anyhow::bail!("image.workdir '{}' must be an absolute path", image.workdir);
        }

        if image.concurrency.group.trim().is_empty() {
            anyhow::bail!("image.concurrency.group must not be empty");
        }
        if image.concurrency.cancel_in_progress {
            anyhow::bail!("image.concurrency.cancel_in_progress is not supported");
        }

        let native = &image.native;
        if !is_sha256_hex(&native.sha256) {
            anyhow::bail!(
                "image.native.sha256 must be a 64-character lowercase hex digest, got '{}'",
                native.sha256
            );
        }
        let url = self
            .native_url()
            .map_err(|e| anyhow::anyhow!("image.native.url: {}", e))?;
        let parsed = Url::parse(&url)
            .with_context(|| format!("image.native.url '{}' is not a valid URL", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("image.native.url must use http or https, got '{}'", parsed.scheme());
        }

        let resolver = &image.resolver;
        if !placeholders(&resolver.command).iter().any(|p| p == "groups") {
            anyhow::bail!("image.resolver.command must contain {{{{ groups }}}}");
        }
        if let Some(mirror) = &resolver.mirror {
            let parsed = Url::parse(&mirror.url)
                .with_context(|| format!("image.resolver.mirror.url '{}' is not a valid URL", mirror.url))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                anyhow::bail!("image.resolver.mirror.url must be an http(s) URL with a host");
            }
        }

        Ok(())
    }

    fn validate_docs(&self) -> Result<()> {
        let docs = &self.docs;

        if docs.flag.name.trim().is_empty() {
            anyhow::bail!("docs.flag.name must not be empty");
        }

        for group in &docs.groups {
            if group == "main" {
                anyhow::bail!("docs.groups must not list 'main'; it is always installed");
            }
            if group.is_empty()
                || !group
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                anyhow::bail!("Invalid dependency group name '{}'", group);
            }
        }

        if docs.output_dir.trim().is_empty() || docs.output_dir.starts_with('/') || docs.output_dir.contains("..") {
            anyhow::bail!(
                "docs.output_dir '{}' must be a relative path inside the workdir",
                docs.output_dir
            );
        }

        Ok(())
    }

    fn validate_publish(&self) -> Result<()> {
        let concurrency = &self.publish.concurrency;
        if concurrency.group.trim().is_empty() {
            anyhow::bail!("publish.concurrency.group must not be empty");
        }
        if concurrency.cancel_in_progress {
            anyhow::bail!(
                "publish.concurrency.cancel_in_progress must be false; in-flight deploys are never cancelled"
            );
        }

        if let TargetConfig::Command { deploy, .. } = &self.publish.target {
            if deploy.trim().is_empty() {
                anyhow::bail!("publish.target.deploy must not be empty");
            }
        }

        Ok(())
    }

    /// Every placeholder must be something a stage will provide
    fn check_placeholders(&self) -> Result<()> {
        let base: Vec<String> = self.base_variables().into_keys().collect();
        let with = |extra: &[&str]| -> Vec<String> {
            base.iter()
                .cloned()
                .chain(extra.iter().map(|s| s.to_string()))
                .collect()
        };

        let native_vars = with(&["native.src", "native.archive"]);
        let url_vars = with(&["version", "name"]);
        let resolver_vars = with(&["groups"]);
        let docs_vars = with(&["output_dir", "run_id", "revision", "branch"]);

        let checks: Vec<(&str, &str, &Vec<String>)> = vec![
            ("image.native.url", self.image.native.url.as_str(), &url_vars),
            ("image.native.configure", self.image.native.configure.as_str(), &native_vars),
            ("image.native.compile", self.image.native.compile.as_str(), &native_vars),
            ("image.native.install", self.image.native.install.as_str(), &native_vars),
            ("image.resolver.install", self.image.resolver.install.as_str(), &base),
            ("image.resolver.command", self.image.resolver.command.as_str(), &resolver_vars),
            ("docs.generator", self.docs.generator.as_str(), &docs_vars),
        ];

        for (field, template, known) in checks {
            let unknown: Vec<String> = placeholders(template)
                .into_iter()
                .filter(|name| !known.contains(name))
                .collect();
            if !unknown.is_empty() {
                anyhow::bail!("{} references unknown variable(s): {}", field, unknown.join(", "));
            }
        }

        Ok(())
    }
}
