//! Dependency resolver invocation

use crate::core::config::{MirrorConfig, ResolverConfig};
use crate::core::step::Step;
use crate::digest::{hash_file, ContentHash};
use crate::error::PipelineError;
use reqwest::Url;
use std::path::{Path, PathBuf};

/// Dependency group that is always installed
pub const MAIN_GROUP: &str = "main";

/// Ordered set of dependency groups, always starting with `main`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGroups(Vec<String>);

impl DependencyGroups {
    pub fn main_only() -> Self {
        Self(vec![MAIN_GROUP.to_string()])
    }

    /// `main` plus additional groups; duplicates are dropped
    pub fn with<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut groups = Self::main_only();
        for group in extra {
            let group = group.into();
            if !groups.0.contains(&group) {
                groups.0.push(group);
            }
        }
        groups
    }

    pub fn contains(&self, group: &str) -> bool {
        self.0.iter().any(|g| g == group)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Comma-joined form used in resolver commands, e.g. `main,doc`
    pub fn as_arg(&self) -> String {
        self.0.join(",")
    }
}

impl std::fmt::Display for DependencyGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_arg())
    }
}

/// The lock file and its digest at build time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    pub path: PathBuf,
    pub digest: ContentHash,
}

impl LockState {
    /// Hash the lock file; a missing file is a build error
    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::MissingLockFile(path.display().to_string()));
        }
        let digest = hash_file(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            digest,
        })
    }
}

/// Commands pointing the package installer at a mirror
pub fn mirror_script(mirror: &MirrorConfig) -> String {
    let mut script = format!("pip config set global.index-url {}", mirror.url);
    if mirror.trusted {
        if let Some(host) = Url::parse(&mirror.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
        {
            script.push_str(&format!(" && pip config set global.trusted-host {}", host));
        }
    }
    script
}

/// Mirror (optional), resolver install and dependency install steps.
///
/// The install command reads `{{ groups }}` from the pipeline variables.
pub fn resolver_steps(resolver: &ResolverConfig) -> Vec<Step> {
    let mut steps = Vec::new();

    if let Some(mirror) = &resolver.mirror {
        steps.push(Step::exec(
            "configure-mirror",
            "Configure package mirror",
            mirror_script(mirror),
        ));
    }

    steps.push(Step::exec(
        "install-resolver",
        "Install dependency manager",
        resolver.install.clone(),
    ));
    steps.push(Step::exec(
        "install-dependencies",
        "Install locked dependencies",
        resolver.command.clone(),
    ));

    steps
}
