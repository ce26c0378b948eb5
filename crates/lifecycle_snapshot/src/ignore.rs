//! Sources of paths that are excluded from snapshots.

use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;

/// The mount table of the current process on Linux.
pub const DEFAULT_MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Supplies additional ignored paths when a snapshotter is initialized.
///
/// Returned paths are absolute and spelled the same way as the watched root
/// so they can be compared with the paths encountered while walking it.
pub trait IgnoreListProvider: Debug + Send + Sync {
    /// Returns the paths below `root` that should not be snapshotted.
    fn ignored_paths(&self, root: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Adds nothing to the ignore set.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIgnoreList;

impl IgnoreListProvider for NoIgnoreList {
    fn ignored_paths(&self, _root: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Adds a fixed list of paths.
#[derive(Debug, Clone, Default)]
pub struct StaticIgnoreList {
    paths: Vec<PathBuf>,
}

impl StaticIgnoreList {
    /// Constructs a provider that always returns `paths`.
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl IgnoreListProvider for StaticIgnoreList {
    fn ignored_paths(&self, _root: &Path) -> io::Result<Vec<PathBuf>> {
        Ok(self.paths.clone())
    }
}

/// Ignores every mount point strictly below the watched root.
///
/// Build-time mounts (secrets, caches, bind-mounted sources) are injected
/// over the root and must never end up in a layer. Platforms without a
/// mount table file contribute nothing.
#[derive(Debug, Clone)]
pub struct MountInfoIgnoreList {
    mountinfo: PathBuf,
}

impl Default for MountInfoIgnoreList {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNTINFO_PATH)
    }
}

impl MountInfoIgnoreList {
    /// Reads the mount table from `mountinfo`, which uses the format of
    /// `/proc/<pid>/mountinfo`.
    pub fn new(mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
        }
    }
}

impl IgnoreListProvider for MountInfoIgnoreList {
    fn ignored_paths(&self, root: &Path) -> io::Result<Vec<PathBuf>> {
        let contents = match fs::read_to_string(&self.mountinfo) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    "no mount table at {}, not ignoring any mounts",
                    self.mountinfo.display()
                );
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        // Mount points are absolute and resolved, the root may not be.
        let canonical_root = fs::canonicalize(root)?;
        let ignored = parse_mount_points(&contents)
            .into_iter()
            .filter_map(|mount_point| {
                let relative = mount_point.strip_prefix(&canonical_root).ok()?;
                if relative.as_os_str().is_empty() {
                    None
                } else {
                    Some(root.join(relative))
                }
            })
            .collect::<Vec<_>>();

        for path in &ignored {
            tracing::debug!("ignoring mount point {}", path.display());
        }
        Ok(ignored)
    }
}

/// Extracts the mount points from the contents of a mountinfo file.
///
/// The mount point is the fifth whitespace separated field of each line.
/// Malformed lines are skipped.
pub fn parse_mount_points(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// Decodes the `\NNN` octal escapes the kernel uses for whitespace and
/// backslashes in mount points.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
            result.push(value as u8);
            i += 4;
        } else {
            result.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&result).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|digit| (b'0'..=b'7').contains(digit))
}
