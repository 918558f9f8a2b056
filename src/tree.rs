//! Directory tree helpers

use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Copy the contents of `from` into `to`, creating `to` if needed.
///
/// Entries whose path relative to `from` is in `skip` (e.g. `.git` or
/// `build/site`) are not copied, nor is anything below them. Symlinks are
/// copied as the files they point to.
pub fn copy_tree(from: &Path, to: &Path, skip: &[&str]) -> std::io::Result<u64> {
    fs::create_dir_all(to)?;
    let mut copied = 0;

    let skip: Vec<PathBuf> = skip
        .iter()
        .map(|path| {
            Path::new(path)
                .components()
                .filter(|c| !matches!(c, Component::CurDir))
                .collect()
        })
        .collect();

    let walker = WalkDir::new(from)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match entry.path().strip_prefix(from) {
            Ok(rel) if entry.depth() > 0 => !skip.iter().any(|s| s.as_path() == rel),
            _ => true,
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = match entry.path().strip_prefix(from) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let dest = to.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// True when `path` is a directory with at least one entry
pub fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
