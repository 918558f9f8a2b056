//! Documentation artifact upload
//!
//! The generator output is packed into a gzip tarball per run. The tarball
//! digest identifies what was deployed; the tree digest identifies what was
//! built.

use crate::digest::{hash_file, ContentHash};
use crate::stages::docs::BuildOutput;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{debug, info};
use uuid::Uuid;

/// File name of the packed artifact inside its run directory
pub const ARTIFACT_FILE: &str = "artifact.tar.gz";

/// An uploaded documentation artifact
#[derive(Debug, Clone)]
pub struct Artifact {
    pub run_id: Uuid,
    pub path: PathBuf,
    /// SHA-256 of the tarball
    pub digest: ContentHash,
    /// Digest of the unpacked tree
    pub tree_digest: ContentHash,
    pub size: u64,
}

/// Stores packed artifacts under `<root>/<run_id>/`
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pack the build output; any earlier artifact for the run is replaced
    pub async fn upload(&self, output: &BuildOutput) -> std::io::Result<Artifact> {
        let run_id = output.run_id();
        let site_dir = output.site_dir().to_path_buf();
        let run_dir = self.root.join(run_id.to_string());
        let tree_digest = output.digest().clone();

        let artifact = tokio::task::spawn_blocking(move || -> std::io::Result<Artifact> {
            if run_dir.exists() {
                fs::remove_dir_all(&run_dir)?;
            }
            fs::create_dir_all(&run_dir)?;

            let path = run_dir.join(ARTIFACT_FILE);
            pack_dir(&site_dir, &path)?;

            Ok(Artifact {
                run_id,
                digest: hash_file(&path)?,
                size: fs::metadata(&path)?.len(),
                path,
                tree_digest,
            })
        })
        .await
        .map_err(std::io::Error::other)??;

        info!(
            run_id = %run_id,
            digest = %artifact.digest.short(12),
            size = artifact.size,
            "Artifact uploaded"
        );
        Ok(artifact)
    }

    /// Remove every run directory except `keep`'s.
    ///
    /// Called once `keep` is live, so the store only ever holds the
    /// deployed artifact plus whatever is being published right now.
    pub async fn prune_except(&self, keep: Uuid) -> std::io::Result<usize> {
        let root = self.root.clone();
        let keep = keep.to_string();

        tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            if !root.exists() {
                return Ok(0);
            }
            let mut removed = 0;
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy() == keep || !entry.file_type()?.is_dir() {
                    continue;
                }
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
            Ok(removed)
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

/// Pack the contents of `dir` (not `dir` itself) into a gzip tarball
pub fn pack_dir(dir: &Path, dest: &Path) -> std::io::Result<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(true);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    debug!("Packed {} into {}", dir.display(), dest.display());
    Ok(())
}

/// Unpack a tarball produced by [`pack_dir`] into `dest`
pub fn unpack(archive_path: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;
    Ok(())
}
