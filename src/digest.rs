//! SHA-256 helpers for lock files, archives and artifact trees

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

/// A full 64-character lowercase hex SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// First `len` hex characters, used in tags and short displays
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hash arbitrary bytes
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    ContentHash(format!("{:x}", hasher.finalize()))
}

/// Hash a file's contents in fixed-size chunks
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Deterministic hash of a directory tree.
///
/// Covers relative paths, file contents and directory structure. Timestamps
/// and permissions are ignored, so two trees with the same files hash equal.
pub fn hash_directory(path: &Path) -> std::io::Result<ContentHash> {
    let mut entries: Vec<String> = Vec::new();

    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        if rel.is_empty() {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_file() {
            entries.push(format!("F:{}:{}", rel, hash_file(entry.path())?));
        } else if file_type.is_dir() {
            entries.push(format!("D:{}", rel));
        }
    }

    entries.sort();

    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }

    Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Check that a string looks like a lowercase hex SHA-256
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}
