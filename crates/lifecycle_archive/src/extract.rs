//! Applying layer archives onto a destination root.

use std::collections::HashSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use fs_err as fs;

use crate::normalize::{
    NormalizeError, PathNormalizer, PosixLayout, SplitLayout, FILES_DIR, HIVES_DIR,
};
use crate::reader::{NormalizedEntry, NormalizingTarReader, TransformError};
use crate::whiteout::{parse_whiteout, Whiteout};

/// Permission bits that are applied from the archive.
#[cfg(unix)]
const MODE_BITS: u32 = 0o7777;

/// An error that can occur when extracting a layer archive.
#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    /// An entry would be written outside of the destination root.
    #[error("path traversal attempt in archive: {0}")]
    PathTraversal(String),

    /// An entry name could not be decoded.
    #[error("archive entry name is not valid utf-8: {0}")]
    InvalidName(String),

    /// The archive itself could not be read.
    #[error("failed to read layer archive")]
    ReadArchive(#[source] io::Error),

    /// The destination root could not be created.
    #[error("could not create the destination path {}", .0.display())]
    CouldNotCreateDestination(PathBuf, #[source] io::Error),

    /// The destination path cannot be used as a prefix for entry names.
    #[error("the destination path {} is not valid utf-8", .0.display())]
    InvalidDestination(PathBuf),

    /// No destination was given and the platform has no default.
    #[error("a destination is required to extract a layer on this platform")]
    MissingDestination,

    /// Applying an entry failed.
    #[error("failed to extract {}", path.display())]
    Io {
        /// The write target of the entry.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl From<NormalizeError> for ExtractError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::PathTraversal(path) => ExtractError::PathTraversal(path),
            NormalizeError::InvalidName(name) => ExtractError::InvalidName(name),
        }
    }
}

impl From<TransformError> for ExtractError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::Read(err) => ExtractError::ReadArchive(err),
            TransformError::Normalize(err) => err.into(),
        }
    }
}

/// The filesystem layout family of the machine a layer is extracted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// A single tree rooted at `/`.
    Posix,
    /// The split `Hives`/`Files` layout below a drive root.
    Windows,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub const fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Posix
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}

/// Counts of the entries applied by an extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Regular files written.
    pub files: usize,
    /// Directories created or updated.
    pub directories: usize,
    /// Symbolic and hard links created.
    pub links: usize,
    /// Whiteouts applied, including opaque whiteouts.
    pub whiteouts: usize,
}

/// Extracts layer archives using the rules of a [`Platform`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor {
    platform: Platform,
}

impl Extractor {
    /// Constructs an extractor for the given platform.
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// The platform whose rules are applied.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Returns the normalizer for extracting onto `destination`.
    ///
    /// On POSIX the `Hives` and `Files` labels of a split layer are stripped
    /// so both trees land below the destination. On Windows registry hives
    /// are skipped, the `Files` tree is mapped onto the destination and the
    /// destination defaults to `c:\`.
    pub fn normalizer(&self, destination: Option<&str>) -> PathNormalizer {
        let normalizer = match self.platform {
            Platform::Posix => PathNormalizer::new()
                .strip(HIVES_DIR)
                .strip(FILES_DIR)
                .with_layout(PosixLayout),
            Platform::Windows => PathNormalizer::new()
                .exclude_paths([HIVES_DIR])
                .strip(FILES_DIR)
                .with_layout(SplitLayout),
        };
        match destination {
            Some(destination) => normalizer.prepend_dir(destination),
            None => normalizer,
        }
    }

    /// Extracts the tar stream `reader` onto `destination`.
    ///
    /// Extraction stops at the first error. Entries applied before the error
    /// are left in place.
    pub fn extract(
        &self,
        reader: impl Read,
        destination: Option<&Path>,
    ) -> Result<ExtractSummary, ExtractError> {
        let destination = destination
            .map(|path| {
                path.to_str()
                    .ok_or_else(|| ExtractError::InvalidDestination(path.to_path_buf()))
            })
            .transpose()?;

        let normalizer = self.normalizer(destination);
        let root = PathBuf::from(
            normalizer
                .destination()
                .ok_or(ExtractError::MissingDestination)?,
        );

        fs::create_dir_all(&root)
            .map_err(|err| ExtractError::CouldNotCreateDestination(root.clone(), err))?;
        let canonical_root = fs::canonicalize(&root)
            .map_err(|err| ExtractError::CouldNotCreateDestination(root.clone(), err))?;

        let mut reader =
            NormalizingTarReader::with_normalizer(tar::Archive::new(reader), normalizer);
        let mut unpacker = Unpacker::new(canonical_root);
        for entry in reader.entries().map_err(ExtractError::ReadArchive)? {
            unpacker.apply(entry?)?;
        }
        let summary = unpacker.finish()?;

        tracing::info!(
            "extracted layer onto {}: {} files, {} directories, {} links, {} whiteouts",
            root.display(),
            summary.files,
            summary.directories,
            summary.links,
            summary.whiteouts
        );

        Ok(summary)
    }
}

/// Extracts the tar stream `reader` onto `destination` using the rules of
/// the current platform.
pub fn extract(reader: impl Read, destination: &Path) -> Result<ExtractSummary, ExtractError> {
    Extractor::new(Platform::current()).extract(reader, Some(destination))
}

/// A directory whose metadata is applied once all entries are written.
struct DeferredDirectory {
    path: PathBuf,
    #[cfg_attr(not(unix), allow(dead_code))]
    mode: Option<u32>,
    mtime: Option<FileTime>,
}

/// The state of a single extraction.
struct Unpacker {
    created: CreatedDirectories,
    written: HashSet<PathBuf>,
    deferred: Vec<DeferredDirectory>,
    summary: ExtractSummary,
}

impl Unpacker {
    fn new(root: PathBuf) -> Self {
        Self {
            created: CreatedDirectories::new(root),
            written: HashSet::new(),
            deferred: Vec::new(),
            summary: ExtractSummary::default(),
        }
    }

    fn apply<R: Read>(&mut self, mut entry: NormalizedEntry<'_, R>) -> Result<(), ExtractError> {
        let target = entry.path().target_path();
        let io_err = |source: io::Error| ExtractError::Io {
            path: target.clone(),
            source,
        };

        if let Some(whiteout) = entry
            .path()
            .layer_path()
            .file_name()
            .and_then(parse_whiteout)
        {
            let parent = target.parent().unwrap_or(Path::new(""));
            if fs::symlink_metadata(parent).is_err() {
                // Nothing below a missing directory can be deleted.
                self.summary.whiteouts += 1;
                return Ok(());
            }
            self.verify_within_root(parent, &target)?;
            match whiteout {
                Whiteout::Path(name) => {
                    let deleted = parent.join(name);
                    tracing::debug!("applying whiteout for {}", deleted.display());
                    remove_path(&deleted).map_err(io_err)?;
                    self.created.forget(&deleted);
                }
                Whiteout::Opaque => {
                    tracing::debug!("applying opaque whiteout to {}", parent.display());
                    self.clear_directory(parent).map_err(io_err)?;
                }
            }
            self.summary.whiteouts += 1;
            return Ok(());
        }

        let entry_type = entry.entry_type();
        let mode = entry.header().mode().ok();
        let mtime = get_mtime(entry.header());

        if entry_type.is_dir() {
            if let Some(parent) = target.parent() {
                self.prepare_parent(parent, &target)?;
            }
            if let Ok(metadata) = fs::symlink_metadata(&target) {
                if !metadata.is_dir() {
                    fs::remove_file(&target).map_err(io_err)?;
                    self.created.forget(&target);
                }
            }
            self.created.create_dir_all(&target).map_err(io_err)?;
            self.deferred.push(DeferredDirectory {
                path: target.clone(),
                mode,
                mtime,
            });
            self.written.insert(target);
            self.summary.directories += 1;
            return Ok(());
        }

        let parent = target.parent().unwrap_or(Path::new(""));
        self.prepare_parent(parent, &target)?;

        if entry_type.is_file() || entry_type.is_contiguous() {
            remove_path(&target).map_err(io_err)?;
            self.created.forget(&target);
            let mut file = fs::File::create(&target).map_err(io_err)?;
            io::copy(&mut entry, &mut file).map_err(io_err)?;
            drop(file);

            #[cfg(unix)]
            if let Some(mode) = mode {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(
                    &target,
                    std::fs::Permissions::from_mode(mode & MODE_BITS),
                )
                .map_err(io_err)?;
            }

            if let Some(mtime) = mtime {
                set_mtime(&target, mtime);
            }
            self.summary.files += 1;
        } else if entry_type.is_symlink() {
            // On Windows, skip symlinks as they require special privileges
            #[cfg(windows)]
            {
                tracing::warn!("skipping symlink in layer archive: {}", target.display());
                return Ok(());
            }

            #[cfg(unix)]
            {
                let Some(link_target) = entry.link_name().map_err(io_err)? else {
                    tracing::debug!("skipping symlink without a target: {}", target.display());
                    return Ok(());
                };
                remove_path(&target).map_err(io_err)?;
                self.created.forget(&target);
                std::os::unix::fs::symlink(&link_target, &target).map_err(io_err)?;
                self.summary.links += 1;
            }
        } else if entry_type.is_hard_link() {
            let Some(link_target) = entry.link_target() else {
                tracing::debug!(
                    "skipping hard link to an excluded entry: {}",
                    target.display()
                );
                return Ok(());
            };
            let link_target = link_target.target_path();
            if let Some(link_parent) = link_target.parent() {
                self.verify_within_root(link_parent, &target)?;
            }
            remove_path(&target).map_err(io_err)?;
            fs::hard_link(&link_target, &target).map_err(io_err)?;
            self.summary.links += 1;
        } else {
            tracing::debug!(
                "skipping unsupported entry type {:?}: {}",
                entry_type,
                target.display()
            );
            return Ok(());
        }

        self.written.insert(target);
        Ok(())
    }

    /// Creates `parent` once the part of it that already exists is known to
    /// resolve inside the destination.
    fn prepare_parent(&mut self, parent: &Path, target: &Path) -> Result<(), ExtractError> {
        let existing = parent
            .ancestors()
            .find(|ancestor| fs::symlink_metadata(ancestor).is_ok())
            .unwrap_or(self.created.root());
        self.verify_within_root(existing, target)?;
        self.created
            .create_dir_all(parent)
            .map_err(|source| ExtractError::Io {
                path: target.to_path_buf(),
                source,
            })
    }

    /// Rejects `target` if `parent` resolves outside of the destination, e.g.
    /// through a symlink written by an earlier entry.
    fn verify_within_root(&self, parent: &Path, target: &Path) -> Result<(), ExtractError> {
        let resolved = fs::canonicalize(parent).map_err(|source| ExtractError::Io {
            path: target.to_path_buf(),
            source,
        })?;
        if resolved.starts_with(self.created.root()) {
            Ok(())
        } else {
            Err(ExtractError::PathTraversal(target.display().to_string()))
        }
    }

    /// Removes the children of `dir` that were not written by this archive.
    fn clear_directory(&mut self, dir: &Path) -> io::Result<()> {
        let children = match fs::read_dir(dir) {
            Ok(children) => children,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for child in children {
            let child = child?.path();
            if !self.written.contains(&child) {
                remove_path(&child)?;
                self.created.forget(&child);
            }
        }
        Ok(())
    }

    /// Applies the metadata of directories, deepest first.
    fn finish(mut self) -> Result<ExtractSummary, ExtractError> {
        while let Some(dir) = self.deferred.pop() {
            #[cfg(unix)]
            if let Some(mode) = dir.mode {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(
                    &dir.path,
                    std::fs::Permissions::from_mode(mode & MODE_BITS),
                )
                .map_err(|source| ExtractError::Io {
                    path: dir.path.clone(),
                    source,
                })?;
            }
            if let Some(mtime) = dir.mtime {
                set_mtime(&dir.path, mtime);
            }
        }
        Ok(self.summary)
    }
}

/// Removes whatever is at `path`, succeeding if nothing is there.
fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Applies `mtime` to `path`. Failing to do so does not fail the extraction.
fn set_mtime(path: &Path, mtime: FileTime) {
    if let Err(err) = filetime::set_file_mtime(path, mtime) {
        tracing::debug!("could not set the mtime of {}: {err}", path.display());
    }
}

/// Gets the mtime from a tar header, handling zero values.
fn get_mtime(header: &tar::Header) -> Option<FileTime> {
    let mtime = header.mtime().ok()?;
    // Use 1 instead of 0 for compatibility (same as tar crate)
    let mtime = if mtime == 0 { 1 } else { mtime };
    Some(FileTime::from_unix_time(mtime as i64, 0))
}

/// A helper struct to memoize directory creation.
struct CreatedDirectories {
    created: HashSet<PathBuf>,
    root: PathBuf,
}

impl CreatedDirectories {
    fn new(root: PathBuf) -> Self {
        Self {
            created: HashSet::from_iter([root.clone()]),
            root,
        }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn create_dir_all(&mut self, path: &Path) -> io::Result<()> {
        if path.as_os_str().is_empty() || !self.created.insert(path.to_path_buf()) {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }

        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => {
                self.created.remove(path);
                Err(e)
            }
        }
    }

    /// Forgets `path` and everything below it after it has been removed.
    fn forget(&mut self, path: &Path) {
        self.created.retain(|created| !created.starts_with(path));
    }
}
