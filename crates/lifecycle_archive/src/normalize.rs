//! Rewriting of tar entry names into destination paths.
//!
//! Every entry name passes through the same fixed sequence of stages:
//!
//! 1. the name is canonicalized (leading `/` and `.` components dropped, `..`
//!    rejected),
//! 2. configured leading labels are stripped,
//! 3. excluded prefixes drop the entry,
//! 4. the [`LayoutStrategy`] converts the path into its on-disk form,
//! 5. the destination root is prepended.
//!
//! The order of the stages is independent of the order in which the
//! [`PathNormalizer`] was configured.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use typed_path::{Utf8UnixComponent, Utf8UnixPath, Utf8UnixPathBuf};

/// Top-level directory of a split-layout layer that holds registry hives.
pub const HIVES_DIR: &str = "Hives";

/// Top-level directory of a split-layout layer that holds regular files.
pub const FILES_DIR: &str = "Files";

/// Destination used by the split layout when none is configured.
pub const DEFAULT_SPLIT_DESTINATION: &str = "c:\\";

/// An error that can occur while normalizing the name of an archive entry.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    /// The entry would be written outside of the destination root.
    #[error("path traversal attempt in archive: {0}")]
    PathTraversal(String),

    /// The entry name is not valid UTF-8.
    #[error("archive entry name is not valid utf-8: {0}")]
    InvalidName(String),
}

/// A single stage of the normalization pipeline.
///
/// A stage receives the path produced by the previous stage and either
/// returns a (possibly rewritten) path or `None` to drop the entry.
pub trait EntryTransform: Debug + Send + Sync {
    /// Transforms a canonical layer path.
    fn transform(&self, path: Utf8UnixPathBuf) -> Option<Utf8UnixPathBuf>;
}

/// Removes a leading path segment if it equals a label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strip {
    label: String,
}

impl Strip {
    /// Constructs a stage that strips `label` from the front of a path.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl EntryTransform for Strip {
    fn transform(&self, path: Utf8UnixPathBuf) -> Option<Utf8UnixPathBuf> {
        let Ok(stripped) = path.strip_prefix(Utf8UnixPath::new(&self.label)) else {
            return Some(path);
        };

        // The label itself carries no content once it has been removed.
        if stripped.as_str().is_empty() {
            None
        } else {
            Some(stripped.to_path_buf())
        }
    }
}

/// Drops every path that equals or lies below one of the excluded prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclude {
    prefixes: Vec<Utf8UnixPathBuf>,
}

impl Exclude {
    /// Adds prefixes to exclude. Prefixes are canonicalized the same way
    /// entry names are; prefixes that canonicalize to nothing are ignored.
    pub fn extend<I, S>(&mut self, prefixes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prefixes.extend(
            prefixes
                .into_iter()
                .filter_map(|prefix| canonicalize(prefix.as_ref()).ok().flatten()),
        );
    }

    /// Returns true if `path` is covered by one of the prefixes.
    pub fn is_excluded(&self, path: &Utf8UnixPath) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_path()))
    }
}

impl EntryTransform for Exclude {
    fn transform(&self, path: Utf8UnixPathBuf) -> Option<Utf8UnixPathBuf> {
        if self.is_excluded(&path) {
            None
        } else {
            Some(path)
        }
    }
}

/// Describes how a canonical layer path is laid out on disk.
pub trait LayoutStrategy: Debug + Send + Sync {
    /// Converts a canonical, relative layer path into the on-disk form.
    fn convert(&self, path: &Utf8UnixPath) -> Result<String, NormalizeError>;

    /// Joins a converted path onto a destination root.
    fn prepend(&self, destination: &str, converted: &str) -> String;

    /// The destination root used when none is configured.
    fn default_destination(&self) -> Option<&str> {
        None
    }
}

/// The single tree layout used on POSIX systems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PosixLayout;

impl LayoutStrategy for PosixLayout {
    fn convert(&self, path: &Utf8UnixPath) -> Result<String, NormalizeError> {
        Ok(path.as_str().to_owned())
    }

    fn prepend(&self, destination: &str, converted: &str) -> String {
        Utf8UnixPath::new(destination)
            .join(Utf8UnixPath::new(converted))
            .as_str()
            .to_owned()
    }
}

/// The split `Hives`/`Files` layout used by Windows layers.
///
/// Paths are rendered with `\` separators below a drive root. Segments that
/// contain a `\` or `:` are rejected because they would change meaning once
/// the separators are converted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitLayout;

impl LayoutStrategy for SplitLayout {
    fn convert(&self, path: &Utf8UnixPath) -> Result<String, NormalizeError> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Utf8UnixComponent::Normal(segment) if !segment.contains(['\\', ':']) => {
                    segments.push(segment);
                }
                _ => return Err(NormalizeError::PathTraversal(path.as_str().to_owned())),
            }
        }
        Ok(segments.join("\\"))
    }

    fn prepend(&self, destination: &str, converted: &str) -> String {
        if destination.ends_with(['\\', '/']) {
            format!("{destination}{converted}")
        } else {
            format!("{destination}\\{converted}")
        }
    }

    fn default_destination(&self) -> Option<&str> {
        Some(DEFAULT_SPLIT_DESTINATION)
    }
}

/// Packs a single tree into the names of a split `Hives`/`Files` layer.
///
/// Paths below a registry root are moved below `Hives`, everything else
/// below `Files`. `Hives` itself is always a registry root, so hives that
/// already carry their label keep their names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitLayerLayout {
    registry_roots: Vec<Utf8UnixPathBuf>,
}

impl Default for SplitLayerLayout {
    fn default() -> Self {
        Self {
            registry_roots: vec![Utf8UnixPath::new(HIVES_DIR).to_path_buf()],
        }
    }
}

impl SplitLayerLayout {
    /// A layout whose only registry root is `Hives`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats everything below `root` as registry state. Roots that
    /// canonicalize to nothing are ignored.
    pub fn with_registry_root(mut self, root: &str) -> Self {
        if let Ok(Some(root)) = canonicalize(root) {
            self.registry_roots.push(root);
        }
        self
    }

    /// Returns true if `path` is placed below `Hives`.
    pub fn is_registry_path(&self, path: &Utf8UnixPath) -> bool {
        self.registry_remainder(path).is_some()
    }

    fn registry_remainder<'p>(&self, path: &'p Utf8UnixPath) -> Option<&'p Utf8UnixPath> {
        self.registry_roots
            .iter()
            .find_map(|root| path.strip_prefix(root.as_path()).ok())
    }
}

impl LayoutStrategy for SplitLayerLayout {
    fn convert(&self, path: &Utf8UnixPath) -> Result<String, NormalizeError> {
        let (label, rest) = match self.registry_remainder(path) {
            Some(rest) => (HIVES_DIR, rest),
            None => (FILES_DIR, path),
        };
        let mut converted = Utf8UnixPath::new(label).to_path_buf();
        if !rest.as_str().is_empty() {
            converted.push(rest);
        }
        Ok(converted.as_str().to_owned())
    }

    fn prepend(&self, destination: &str, converted: &str) -> String {
        PosixLayout.prepend(destination, converted)
    }
}

/// The result of normalizing a single entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPath {
    layer_path: Utf8UnixPathBuf,
    target: String,
}

impl NormalizedPath {
    /// The canonical path after stripping, relative to the layer root.
    pub fn layer_path(&self) -> &Utf8UnixPath {
        &self.layer_path
    }

    /// The final write target, including the destination root.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The write target as a native path.
    pub fn target_path(&self) -> PathBuf {
        PathBuf::from(&self.target)
    }
}

/// Rewrites archive entry names into write targets.
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    strip: Vec<Strip>,
    exclude: Exclude,
    layout: Arc<dyn LayoutStrategy>,
    destination: Option<String>,
}

impl Default for PathNormalizer {
    fn default() -> Self {
        Self {
            strip: Vec::new(),
            exclude: Exclude::default(),
            layout: Arc::new(PosixLayout),
            destination: None,
        }
    }
}

impl PathNormalizer {
    /// A normalizer that only canonicalizes names using the POSIX layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Strips `label` when it is the first segment of a name.
    pub fn strip(mut self, label: impl Into<String>) -> Self {
        self.strip.push(Strip::new(label));
        self
    }

    /// Drops entries below any of the given prefixes.
    pub fn exclude_paths<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exclude.extend(prefixes);
        self
    }

    /// Uses the given layout for the on-disk form of paths.
    pub fn with_layout(mut self, layout: impl LayoutStrategy + 'static) -> Self {
        self.layout = Arc::new(layout);
        self
    }

    /// Prepends `destination` to every write target.
    pub fn prepend_dir(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// The destination that is prepended to targets, if any.
    pub fn destination(&self) -> Option<&str> {
        self.destination
            .as_deref()
            .filter(|destination| !destination.is_empty())
            .or_else(|| self.layout.default_destination())
    }

    fn stages(&self) -> impl Iterator<Item = &dyn EntryTransform> {
        self.strip
            .iter()
            .map(|stage| stage as &dyn EntryTransform)
            .chain(std::iter::once(&self.exclude as &dyn EntryTransform))
    }

    /// Normalizes a raw entry name.
    ///
    /// Returns `Ok(None)` if the entry should be skipped, either because it
    /// names the archive root or because it was excluded.
    pub fn normalize(&self, name: &str) -> Result<Option<NormalizedPath>, NormalizeError> {
        let Some(canonical) = canonicalize(name)? else {
            return Ok(None);
        };

        let Some(layer_path) = self
            .stages()
            .try_fold(canonical, |path, stage| stage.transform(path))
        else {
            tracing::trace!("excluding archive entry {name}");
            return Ok(None);
        };

        let converted = self.layout.convert(&layer_path)?;
        let target = match self.destination() {
            Some(destination) => self.layout.prepend(destination, &converted),
            None => converted,
        };

        Ok(Some(NormalizedPath { layer_path, target }))
    }

    /// Normalizes a raw entry name given as bytes.
    pub fn normalize_bytes(&self, name: &[u8]) -> Result<Option<NormalizedPath>, NormalizeError> {
        let name = std::str::from_utf8(name)
            .map_err(|_err| NormalizeError::InvalidName(String::from_utf8_lossy(name).into()))?;
        self.normalize(name)
    }
}

/// Converts an entry name into a relative path without `.` components.
///
/// Leading `/`s are trimmed and repeated separators collapse. Any `..`
/// component is rejected outright rather than resolved, see e.g.
/// CVE-2001-1267, CVE-2002-0399, CVE-2005-1918, CVE-2007-4131.
pub fn canonicalize(name: &str) -> Result<Option<Utf8UnixPathBuf>, NormalizeError> {
    let path = Utf8UnixPath::new(name);
    let mut result = Utf8UnixPathBuf::new();
    for component in path.components() {
        match component {
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => {}
            Utf8UnixComponent::ParentDir => {
                return Err(NormalizeError::PathTraversal(name.to_owned()))
            }
            Utf8UnixComponent::Normal(segment) => result.push(Utf8UnixPath::new(segment)),
        }
    }

    if result.as_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(result))
    }
}
