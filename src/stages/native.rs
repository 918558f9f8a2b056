//! Native dependency builder
//!
//! The native library is downloaded once per image build on the host,
//! verified against its pinned SHA-256, copied into the build container and
//! compiled there from a freshly extracted source directory.

use crate::core::config::PipelineConfig;
use crate::core::context::TemplateError;
use crate::core::step::{Step, StepAction};
use crate::digest::{hash_bytes, hash_file};
use crate::error::FailureKind;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Where the archive is staged inside the build container
pub const STAGING_DIR: &str = "/tmp";

/// Error fetching the native source archive
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("GET {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("GET {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A pinned native source archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeArchive {
    pub name: String,
    pub version: String,
    /// Rendered download URL
    pub url: String,
    /// Expected lowercase hex SHA-256
    pub sha256: String,
}

impl NativeArchive {
    /// Build the archive reference from configuration, rendering the URL
    pub fn from_config(config: &PipelineConfig) -> Result<Self, TemplateError> {
        let native = &config.image.native;
        Ok(Self {
            name: native.name.clone(),
            version: native.version.clone(),
            url: config.native_url()?,
            sha256: native.sha256.clone(),
        })
    }

    pub fn short_digest(&self) -> &str {
        &self.sha256[..self.sha256.len().min(12)]
    }

    /// File name the archive is stored under
    pub fn file_name(&self) -> String {
        url_to_filename(&self.url)
    }

    /// Fresh extraction directory inside the build container
    pub fn source_dir(&self) -> String {
        format!("{}/{}-{}", STAGING_DIR, self.name, self.version)
    }

    /// Staged archive path inside the build container
    pub fn staged_path(&self) -> String {
        format!("{}/{}", STAGING_DIR, self.file_name())
    }
}

/// Downloads raw bytes
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTP(S) fetcher backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("docs-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArchiveFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let network = |e: reqwest::Error| FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(network)?;
        Ok(bytes.to_vec())
    }
}

/// Download `archive` into `cache_dir`, verifying its digest.
///
/// A cached file whose digest matches is reused. Downloaded bytes are
/// verified before anything is written, so a corrupted or substituted
/// archive never reaches the build.
pub async fn fetch_verified(
    fetcher: &dyn ArchiveFetcher,
    archive: &NativeArchive,
    cache_dir: &Path,
) -> Result<PathBuf, FetchError> {
    tokio::fs::create_dir_all(cache_dir).await?;
    let dest = cache_dir.join(archive.file_name());

    if dest.exists() {
        match hash_file(&dest) {
            Ok(actual) if actual.as_str() == archive.sha256 => {
                info!(path = ?dest, "Using cached {}", archive.file_name());
                return Ok(dest);
            }
            Ok(actual) => {
                debug!(expected = %archive.sha256, actual = %actual, "Cached archive digest mismatch, downloading again");
            }
            Err(e) => warn!(path = ?dest, "Could not hash cached archive: {}", e),
        }
    }

    info!(url = %archive.url, "Fetching native archive");
    let bytes = fetcher.fetch(&archive.url).await?;

    let actual = hash_bytes(&bytes);
    if actual.as_str() != archive.sha256 {
        return Err(FetchError::HashMismatch {
            url: archive.url.clone(),
            expected: archive.sha256.clone(),
            actual: actual.to_string(),
        });
    }

    let partial = dest.with_extension("partial");
    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(&bytes).await?;
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&partial, &dest).await?;

    info!(path = ?dest, size = bytes.len(), "Download verified");
    Ok(dest)
}

/// Convert a URL to a safe file name
///
/// Uses the last path component; falls back to a hash of the URL.
pub fn url_to_filename(url: &str) -> String {
    let last = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .unwrap_or_default();

    let sanitized: String = last
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
        return sanitized;
    }

    format!("download_{}", hash_bytes(url.as_bytes()).short(16))
}

/// Steps that fetch, stage, build and clean up the native library.
///
/// Commands reference `{{ native.archive }}` and `{{ native.src }}`, which
/// the image stage binds to paths inside the build container.
pub fn native_steps(config: &PipelineConfig, archive: &NativeArchive) -> Vec<Step> {
    let native = &config.image.native;
    let in_src = |command: &str| format!("cd {{{{ native.src }}}} && {}", command);

    vec![
        Step::new(
            "fetch-native",
            format!("Fetch {} {}", archive.name, archive.version),
            StepAction::FetchArchive(archive.clone()),
        )
        .with_failure_kind(FailureKind::Fetch),
        Step::new(
            "stage-native",
            "Stage archive in build container",
            StepAction::CopyIn {
                from: "{{ steps.fetch-native.output }}".to_string(),
                to: archive.staged_path(),
            },
        ),
        Step::exec(
            "extract-native",
            "Extract sources",
            "rm -rf {{ native.src }} && mkdir -p {{ native.src }} && tar -xzf {{ native.archive }} -C {{ native.src }} --strip-components=1",
        ),
        Step::exec("configure-native", "Configure native library", in_src(&native.configure)),
        Step::exec("compile-native", "Compile native library", in_src(&native.compile)),
        Step::exec("install-native", "Install native library", in_src(&native.install)),
        Step::exec(
            "cleanup-native",
            "Remove native build tree",
            "rm -rf {{ native.src }} {{ native.archive }}",
        ),
    ]
}
