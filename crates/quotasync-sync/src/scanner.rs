//! Source tree enumeration
//!
//! Walks a source tree and yields every regular file that is eligible for
//! offloading, as a path relative to the tree root plus its size.
//!
//! Entries whose name starts with `.` are skipped, as are entries ending in
//! `.part`, which writers use for in-progress uploads. A skipped directory
//! hides its whole subtree.

use std::path::Path;

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Suffix of files that are still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// A file found under a source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the tree root, `/`-separated
    pub relative_path: String,
    /// Size in bytes at scan time
    pub size: u64,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

fn is_partial(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.ends_with(PARTIAL_SUFFIX))
        .unwrap_or(false)
}

/// Whether the walk descends into (or reports) `entry`; the root always passes
fn is_eligible(entry: &DirEntry) -> bool {
    entry.depth() == 0 || !(is_hidden(entry) || is_partial(entry))
}

/// Joins the components of `relative` with `/`, or `None` if one is not UTF-8
fn to_slash_path(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Recursively lists the eligible files under `root`
///
/// Unreadable entries (permission denied on a subdirectory, a file removed
/// mid-walk) are logged and skipped. Symbolic links are not followed and are
/// not reported.
pub fn scan_tree(root: &Path) -> Vec<ScannedFile> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(is_eligible);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(root).ok().and_then(to_slash_path) {
            Some(relative) => relative,
            None => {
                warn!(path = %entry.path().display(), "Skipping file with non UTF-8 path");
                continue;
            }
        };

        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Cannot read file metadata");
                continue;
            }
        };

        files.push(ScannedFile {
            relative_path: relative,
            size,
        });
    }

    debug!(root = %root.display(), count = files.len(), "Scanned source tree");
    files
}

/// Lists every directory under `root`, `root` included, that the scan descends into
///
/// Used to (re-)register watches. Unreadable subtrees are logged and skipped.
pub fn list_directories(root: &Path) -> Vec<std::path::PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(is_eligible)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable directory");
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .map(DirEntry::into_path)
        .collect()
}
