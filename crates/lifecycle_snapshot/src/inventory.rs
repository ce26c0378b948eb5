use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use walkdir::WalkDir;

use crate::fingerprint::Fingerprint;
use crate::SnapshotError;

/// The fingerprints of every path below a root, keyed by the path relative
/// to the root.
///
/// Iteration order is the order of a pre-order walk with siblings sorted by
/// name: a directory always comes before its children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    entries: BTreeMap<PathBuf, Fingerprint>,
}

impl Inventory {
    /// Returns the number of recorded paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the fingerprint recorded for a relative path.
    pub fn get(&self, path: &Path) -> Option<&Fingerprint> {
        self.entries.get(path)
    }

    /// Returns true if the relative path was recorded.
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Returns true if the relative path was recorded as a directory.
    pub fn is_dir(&self, path: &Path) -> bool {
        self.get(path).is_some_and(Fingerprint::is_dir)
    }

    /// Iterates over all recorded paths in walk order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Fingerprint)> + '_ {
        self.entries
            .iter()
            .map(|(path, fingerprint)| (path.as_path(), fingerprint))
    }

    /// Iterates over all recorded paths in walk order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.entries.keys().map(PathBuf::as_path)
    }
}

/// The result of walking a root.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub inventory: Inventory,

    /// Relative paths that could not be read. Their descendants are unknown.
    pub unreadable: Vec<PathBuf>,
}

impl Scan {
    /// Returns true if `path` is, or lies below, a path that could not be
    /// read during the walk.
    pub fn is_unreadable(&self, path: &Path) -> bool {
        self.unreadable
            .iter()
            .any(|unreadable| path.starts_with(unreadable))
    }
}

/// Walks `root` without following symlinks and fingerprints every path that
/// does not lie below one of the `ignored` absolute paths.
///
/// Paths that vanish during the walk are left out. Paths that cannot be
/// read because of their permissions are logged and reported as
/// unreadable. Any problem with the root itself is fatal.
pub(crate) fn scan(root: &Path, ignored: &[PathBuf]) -> Result<Scan, SnapshotError> {
    check_root(root)?;

    let mut result = Scan::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored(entry.path(), ignored));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(SnapshotError::Scan {
                    path: root.to_path_buf(),
                    source: err.into(),
                });
            }
            Err(err) => {
                let path = err.path().unwrap_or(root).to_path_buf();
                let source: io::Error = err.into();
                record_failure(root, &path, source, &mut result)?;
                continue;
            }
        };

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        match Fingerprint::from_path(entry.path()) {
            Ok(fingerprint) => {
                result
                    .inventory
                    .entries
                    .insert(relative.to_path_buf(), fingerprint);
            }
            Err(err) => record_failure(root, entry.path(), err, &mut result)?,
        }
    }

    // The root may have been removed while its children were listed.
    check_root(root)?;

    Ok(result)
}

fn check_root(root: &Path) -> Result<(), SnapshotError> {
    let metadata = fs::metadata(root).map_err(|source| SnapshotError::Scan {
        path: root.to_path_buf(),
        source,
    })?;
    if metadata.is_dir() {
        Ok(())
    } else {
        Err(SnapshotError::Scan {
            path: root.to_path_buf(),
            source: io::Error::other("the snapshot root is not a directory"),
        })
    }
}

/// Decides whether a failure to read a single path below the root can be
/// recovered from.
fn record_failure(
    root: &Path,
    path: &Path,
    err: io::Error,
    scan: &mut Scan,
) -> Result<(), SnapshotError> {
    match err.kind() {
        io::ErrorKind::NotFound => {
            tracing::debug!("{} vanished during the walk", path.display());
            Ok(())
        }
        io::ErrorKind::PermissionDenied => {
            tracing::warn!("skipping unreadable path {}: {}", path.display(), err);
            if let Ok(relative) = path.strip_prefix(root) {
                scan.unreadable.push(relative.to_path_buf());
            }
            Ok(())
        }
        _ => Err(SnapshotError::Scan {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

/// Ignored paths match whole components: `/a/layers` ignores `/a/layers/x`
/// but not `/a/layers2`.
pub(crate) fn is_ignored(path: &Path, ignored: &[PathBuf]) -> bool {
    ignored.iter().any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn create_tree(root: &Path) {
        std::fs::create_dir_all(root.join("b/nested")).unwrap();
        std::fs::create_dir_all(root.join("layers/app")).unwrap();
        std::fs::create_dir_all(root.join("layers2")).unwrap();
        std::fs::write(root.join("a.txt"), "a").unwrap();
        std::fs::write(root.join("b/nested/c.txt"), "c").unwrap();
        std::fs::write(root.join("layers/app/ignored.txt"), "x").unwrap();
        std::fs::write(root.join("layers2/kept.txt"), "y").unwrap();
    }

    #[test]
    fn test_scan_is_ordered_and_honors_ignores() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        create_tree(root);

        let scan = scan(root, &[root.join("layers")]).unwrap();
        let paths: Vec<_> = scan
            .inventory
            .paths()
            .map(|path| path.to_string_lossy().replace('\\', "/"))
            .collect();

        assert_eq!(
            paths,
            vec![
                "a.txt",
                "b",
                "b/nested",
                "b/nested/c.txt",
                "layers2",
                "layers2/kept.txt",
            ]
        );
        assert!(scan.unreadable.is_empty());
        assert!(scan.inventory.is_dir(Path::new("b")));
        assert!(!scan.inventory.is_dir(Path::new("a.txt")));
    }

    #[test]
    fn test_is_ignored_matches_components() {
        let ignored = vec![PathBuf::from("/workspace/layers")];
        assert!(is_ignored(Path::new("/workspace/layers"), &ignored));
        assert!(is_ignored(Path::new("/workspace/layers/app"), &ignored));
        assert!(!is_ignored(Path::new("/workspace/layers2"), &ignored));
        assert!(!is_ignored(Path::new("/workspace"), &ignored));
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("missing");
        assert_matches!(
            scan(&root, &[]),
            Err(SnapshotError::Scan { path, .. }) if path == root
        );
    }

    #[test]
    fn test_root_must_be_a_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("file");
        std::fs::write(&root, "").unwrap();
        assert_matches!(scan(&root, &[]), Err(SnapshotError::Scan { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directories_are_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir(root.join("locked")).unwrap();
        std::fs::write(root.join("locked/secret"), "").unwrap();
        std::fs::set_permissions(root.join("locked"), std::fs::Permissions::from_mode(0o000))
            .unwrap();

        // Privileged users can read the directory regardless of its mode.
        let readable = std::fs::read_dir(root.join("locked")).is_ok();
        let scan = scan(root, &[]).unwrap();
        std::fs::set_permissions(root.join("locked"), std::fs::Permissions::from_mode(0o755))
            .unwrap();

        if !readable {
            assert!(scan.is_unreadable(Path::new("locked/secret")));
            assert!(!scan.inventory.contains(Path::new("locked/secret")));
        }
        assert!(scan.inventory.contains(Path::new("locked")));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_root_is_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("file"), "").unwrap();
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o000)).unwrap();

        let readable = std::fs::read_dir(&root).is_ok();
        let result = scan(&root, &[]);
        std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o755)).unwrap();

        if !readable {
            assert_matches!(
                result,
                Err(SnapshotError::Scan { path, source })
                    if path == root && source.kind() == io::ErrorKind::PermissionDenied
            );
        }
    }
}
