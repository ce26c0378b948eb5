use std::path::{Path, PathBuf};

use crate::inventory::{Inventory, Scan};

/// The classification of the paths below a root against a baseline.
///
/// All paths are relative to the root and sorted in walk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Paths that did not exist in the baseline.
    pub added: Vec<PathBuf>,

    /// Paths whose fingerprint differs from the baseline.
    pub modified: Vec<PathBuf>,

    /// The topmost paths of the baseline that no longer exist.
    ///
    /// A deleted directory is listed once; its descendants are implied.
    pub deleted: Vec<PathBuf>,
}

impl Changes {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Compares a fresh scan against the baseline inventory.
pub(crate) fn diff(baseline: &Inventory, current: &Scan) -> Changes {
    let mut changes = Changes::default();

    for (path, fingerprint) in current.inventory.iter() {
        match baseline.get(path) {
            None => {
                tracing::debug!("added {}", path.display());
                changes.added.push(path.to_path_buf());
            }
            Some(previous) if previous != fingerprint => {
                tracing::debug!("modified {}", path.display());
                changes.modified.push(path.to_path_buf());
            }
            Some(_) => {}
        }
    }

    for path in baseline.paths() {
        if current.inventory.contains(path) {
            continue;
        }
        if current.is_unreadable(path) {
            tracing::debug!("not classifying unreadable {}", path.display());
            continue;
        }
        // A whiteout can only be applied inside a directory that is part of
        // the new state. A deleted parent covers this path already and a
        // parent that turned into a file replaces it.
        if !parent_is_dir(&current.inventory, path) {
            continue;
        }
        tracing::debug!("deleted {}", path.display());
        changes.deleted.push(path.to_path_buf());
    }

    changes
}

fn parent_is_dir(inventory: &Inventory, path: &Path) -> bool {
    match path.parent() {
        None => true,
        Some(parent) if parent.as_os_str().is_empty() => true,
        Some(parent) => inventory.is_dir(parent),
    }
}
