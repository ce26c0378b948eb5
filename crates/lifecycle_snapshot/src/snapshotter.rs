use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use fs_err as fs;
use lifecycle_archive::{whiteout_path, PathNormalizer, SplitLayerLayout, FILES_DIR, HIVES_DIR};

use crate::diff::{diff, Changes};
use crate::ignore::{IgnoreListProvider, MountInfoIgnoreList, NoIgnoreList};
use crate::inventory::{scan, Inventory, Scan};
use crate::SnapshotError;

/// Configuration of a [`Snapshotter`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotterOptions {
    /// The directory that is watched for changes.
    pub root_dir: PathBuf,

    /// Paths that are never snapshotted. Relative paths are resolved against
    /// the root.
    pub ignored_paths: Vec<PathBuf>,

    /// Also ignore every mount point below the root, as listed by the
    /// operating system when the snapshotter is initialized.
    pub detect_filesystem_ignore_list: bool,

    /// Write entry names in the split `Hives`/`Files` form of Windows layers.
    pub split_layout: bool,
}

impl SnapshotterOptions {
    /// Watch `root_dir` without ignoring anything.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Adds a path to the ignore set.
    pub fn ignore(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignored_paths.push(path.into());
        self
    }

    /// Enables or disables detection of mount points below the root.
    pub fn detect_filesystem_ignore_list(mut self, detect: bool) -> Self {
        self.detect_filesystem_ignore_list = detect;
        self
    }

    /// Enables or disables split `Hives`/`Files` entry names.
    pub fn split_layout(mut self, split: bool) -> Self {
        self.split_layout = split;
        self
    }
}

/// Counts of what went into a layer archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Number of paths that were created since the baseline.
    pub added: usize,
    /// Number of paths that changed since the baseline.
    pub modified: usize,
    /// Number of whiteouts that were written.
    pub deleted: usize,
    /// Total number of entries in the archive, including unchanged parent
    /// directories.
    pub entries: usize,
}

/// Records the state of a directory tree and turns the changes made to it
/// into a layer archive.
///
/// ```no_run
/// use lifecycle_snapshot::{Snapshotter, SnapshotterOptions};
///
/// # fn main() -> Result<(), lifecycle_snapshot::SnapshotError> {
/// let options = SnapshotterOptions::new("/workspace").ignore("/workspace/layers");
/// let mut snapshotter = Snapshotter::from_options(options);
/// snapshotter.init()?;
/// // ... run the build step ...
/// let summary = snapshotter.take_snapshot("/tmp/layer.tar".as_ref())?;
/// println!("{} entries", summary.entries);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Snapshotter {
    root_dir: PathBuf,
    ignored_paths: Vec<PathBuf>,
    ignore_provider: Box<dyn IgnoreListProvider>,
    resolved_ignores: Vec<PathBuf>,
    layer_names: Option<PathNormalizer>,
    baseline: Option<Inventory>,
}

/// What to write for a single archive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerEntry {
    /// The current state of the path.
    Current,
    /// A whiteout marker.
    Whiteout,
}

impl Snapshotter {
    /// Watches `root_dir`, never snapshotting anything below `ignored_paths`.
    ///
    /// A relative root is made absolute against the current directory so it
    /// can be compared with absolute ignored paths.
    pub fn new(root_dir: impl Into<PathBuf>, ignored_paths: Vec<PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let root_dir = std::path::absolute(&root_dir).unwrap_or(root_dir);
        let ignored_paths = ignored_paths
            .into_iter()
            .map(|path| root_dir.join(path))
            .collect();
        Self {
            root_dir,
            ignored_paths,
            ignore_provider: Box::new(NoIgnoreList),
            resolved_ignores: Vec::new(),
            layer_names: None,
            baseline: None,
        }
    }

    /// Constructs a snapshotter from its options.
    pub fn from_options(options: SnapshotterOptions) -> Self {
        let mut snapshotter = Self::new(options.root_dir, options.ignored_paths);
        if options.detect_filesystem_ignore_list {
            snapshotter = snapshotter.with_ignore_provider(MountInfoIgnoreList::default());
        }
        if options.split_layout {
            snapshotter = snapshotter.with_split_layout(SplitLayerLayout::new());
        }
        snapshotter
    }

    /// Names entries the way `layout` places them in a split layer. The
    /// `Files` and `Hives` directories are written ahead of any change.
    pub fn with_split_layout(mut self, layout: SplitLayerLayout) -> Self {
        self.layer_names = Some(PathNormalizer::new().with_layout(layout));
        self
    }

    /// Uses `provider` to find additional ignored paths in [`Self::init`].
    pub fn with_ignore_provider(mut self, provider: impl IgnoreListProvider + 'static) -> Self {
        self.ignore_provider = Box::new(provider);
        self
    }

    /// The watched directory.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The paths that are not snapshotted. Includes the paths from the
    /// ignore list provider once the snapshotter is initialized.
    pub fn ignored_paths(&self) -> &[PathBuf] {
        if self.baseline.is_some() {
            &self.resolved_ignores
        } else {
            &self.ignored_paths
        }
    }

    /// The inventory that the next snapshot is compared against.
    pub fn baseline(&self) -> Option<&Inventory> {
        self.baseline.as_ref()
    }

    /// Resolves the ignore set and records the current state of the root as
    /// the baseline.
    pub fn init(&mut self) -> Result<(), SnapshotError> {
        let mut ignores = self.ignored_paths.clone();
        let detected = self
            .ignore_provider
            .ignored_paths(&self.root_dir)
            .map_err(|source| SnapshotError::Scan {
                path: self.root_dir.clone(),
                source,
            })?;
        for path in detected {
            if !ignores.contains(&path) {
                ignores.push(path);
            }
        }

        let scan = scan(&self.root_dir, &ignores)?;
        tracing::info!(
            "recorded {} paths below {}",
            scan.inventory.len(),
            self.root_dir.display()
        );

        self.resolved_ignores = ignores;
        self.baseline = Some(scan.inventory);
        Ok(())
    }

    /// Computes what changed since the baseline without writing anything.
    pub fn changes(&self) -> Result<Changes, SnapshotError> {
        let baseline = self.baseline.as_ref().ok_or(SnapshotError::NotInitialized)?;
        let current = scan(&self.root_dir, &self.resolved_ignores)?;
        Ok(diff(baseline, &current))
    }

    /// Writes the changes since the baseline to a tar archive at
    /// `destination` and makes the current state the new baseline.
    ///
    /// The baseline is left untouched if the archive cannot be written.
    /// A partially written archive is not removed.
    pub fn take_snapshot(&mut self, destination: &Path) -> Result<SnapshotSummary, SnapshotError> {
        let baseline = self.baseline.as_ref().ok_or(SnapshotError::NotInitialized)?;
        let current = scan(&self.root_dir, &self.resolved_ignores)?;

        let write_error = |source: io::Error| SnapshotError::Write {
            path: destination.to_path_buf(),
            source,
        };
        let file = fs::File::create(destination).map_err(write_error)?;
        let (writer, summary) =
            self.write_layer(baseline, &current, BufWriter::new(file), Some(destination))?;
        writer
            .into_inner()
            .map_err(io::IntoInnerError::into_error)
            .and_then(|file| file.sync_all())
            .map_err(write_error)?;

        tracing::info!(
            "wrote {} entries to {} ({} added, {} modified, {} deleted)",
            summary.entries,
            destination.display(),
            summary.added,
            summary.modified,
            summary.deleted
        );

        self.baseline = Some(current.inventory);
        Ok(summary)
    }

    /// Like [`Self::take_snapshot`] but writes the archive to `writer`.
    pub fn write_snapshot<W: Write>(&mut self, writer: W) -> Result<SnapshotSummary, SnapshotError> {
        let baseline = self.baseline.as_ref().ok_or(SnapshotError::NotInitialized)?;
        let current = scan(&self.root_dir, &self.resolved_ignores)?;
        let (_, summary) = self.write_layer(baseline, &current, writer, None)?;
        tracing::info!("wrote {} entries", summary.entries);
        self.baseline = Some(current.inventory);
        Ok(summary)
    }

    fn write_layer<W: Write>(
        &self,
        baseline: &Inventory,
        current: &Scan,
        writer: W,
        output: Option<&Path>,
    ) -> Result<(W, SnapshotSummary), SnapshotError> {
        let changes = diff(baseline, current);
        let plan = plan_entries(&changes, &current.inventory);
        let write_error = |entry: &Path, source: io::Error| SnapshotError::Write {
            path: output.unwrap_or(entry).to_path_buf(),
            source,
        };

        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);

        let mut summary = SnapshotSummary {
            added: changes.added.len(),
            modified: changes.modified.len(),
            ..SnapshotSummary::default()
        };
        let mut vanished: Vec<&Path> = Vec::new();

        if self.layer_names.is_some() && !plan.is_empty() {
            for label in [FILES_DIR, HIVES_DIR] {
                append_fixed(&mut builder, Path::new(label), tar::EntryType::Directory, 0o755)
                    .map_err(|err| write_error(Path::new(label), err))?;
                summary.entries += 1;
            }
        }

        for (archive_path, kind) in &plan {
            let name = self
                .layer_name(archive_path)
                .map_err(|err| write_error(archive_path.as_path(), err))?;
            match kind {
                LayerEntry::Whiteout => {
                    append_whiteout(&mut builder, &name)
                        .map_err(|err| write_error(&name, err))?;
                    summary.deleted += 1;
                }
                LayerEntry::Current => {
                    if vanished.iter().any(|path| archive_path.starts_with(path)) {
                        continue;
                    }
                    let source = self.root_dir.join(archive_path);
                    match append_path(&mut builder, &name, &source) {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(AppendError::Vanished) => {
                            tracing::debug!("{} vanished before it was written", source.display());
                            vanished.push(archive_path.as_path());
                            if !baseline.contains(archive_path) {
                                continue;
                            }
                            let Some(whiteout) = whiteout_path(archive_path) else {
                                continue;
                            };
                            let whiteout = self
                                .layer_name(&whiteout)
                                .map_err(|err| write_error(&whiteout, err))?;
                            append_whiteout(&mut builder, &whiteout)
                                .map_err(|err| write_error(&whiteout, err))?;
                            summary.deleted += 1;
                        }
                        Err(AppendError::Read(err)) => {
                            return Err(SnapshotError::Scan {
                                path: source,
                                source: err,
                            });
                        }
                        Err(AppendError::Write(err)) => {
                            return Err(write_error(&name, err));
                        }
                    }
                }
            }
            summary.entries += 1;
        }

        let writer = builder
            .into_inner()
            .and_then(|mut writer| writer.flush().map(|()| writer))
            .map_err(|source| match output {
                Some(path) => SnapshotError::Write {
                    path: path.to_path_buf(),
                    source,
                },
                None => SnapshotError::Finish(source),
            })?;
        Ok((writer, summary))
    }

    /// The name `path` is stored under in the archive.
    fn layer_name<'p>(&self, path: &'p Path) -> io::Result<Cow<'p, Path>> {
        let Some(normalizer) = &self.layer_names else {
            return Ok(Cow::Borrowed(path));
        };

        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} cannot be named in a split layer", path.display()),
            )
        };
        let mut name = String::new();
        for component in path.components() {
            let segment = component.as_os_str().to_str().ok_or_else(invalid)?;
            if !name.is_empty() {
                name.push('/');
            }
            name.push_str(segment);
        }

        let normalized = normalizer
            .normalize(&name)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
            .ok_or_else(invalid)?;
        Ok(Cow::Owned(PathBuf::from(normalized.target())))
    }
}

/// Lists every archive path that has to be written, sorted so that
/// directories come before their children and siblings are ordered by name.
fn plan_entries(changes: &Changes, current: &Inventory) -> BTreeMap<PathBuf, LayerEntry> {
    let mut plan = BTreeMap::new();

    for path in changes.added.iter().chain(&changes.modified) {
        plan.insert(path.clone(), LayerEntry::Current);
        add_parents(&mut plan, path, current);
    }

    for path in &changes.deleted {
        if let Some(whiteout) = whiteout_path(path) {
            add_parents(&mut plan, &whiteout, current);
            plan.insert(whiteout, LayerEntry::Whiteout);
        }
    }

    plan
}

/// Adds the parent directories of `path` so that extracting the archive
/// onto an empty root recreates them with their recorded metadata.
fn add_parents(plan: &mut BTreeMap<PathBuf, LayerEntry>, path: &Path, current: &Inventory) {
    for parent in path.ancestors().skip(1) {
        if parent.as_os_str().is_empty() {
            break;
        }
        if current.contains(parent) {
            plan.entry(parent.to_path_buf())
                .or_insert(LayerEntry::Current);
        }
    }
}

enum AppendError {
    Vanished,
    Read(io::Error),
    Write(io::Error),
}

impl AppendError {
    fn read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            AppendError::Vanished
        } else {
            AppendError::Read(err)
        }
    }
}

/// Appends the entry at `source` under the name `archive_path`. Returns
/// `false` if the entry has a type that cannot be stored in a layer.
fn append_path<W: Write>(
    builder: &mut tar::Builder<W>,
    archive_path: &Path,
    source: &Path,
) -> Result<bool, AppendError> {
    let metadata = fs::symlink_metadata(source).map_err(AppendError::read)?;
    let file_type = metadata.file_type();

    if file_type.is_file() {
        let mut file = fs::File::open(source).map_err(AppendError::read)?;
        // Use the metadata of the opened file so the size in the header
        // matches the body that is streamed.
        let metadata = file.metadata().map_err(AppendError::Read)?;
        let mut header = prepare_header(&metadata).map_err(AppendError::Read)?;
        builder
            .append_data(&mut header, archive_path, (&mut file).take(metadata.len()))
            .map_err(AppendError::Write)?;
    } else if file_type.is_dir() {
        let mut header = prepare_header(&metadata).map_err(AppendError::Read)?;
        header.set_size(0);
        builder
            .append_data(&mut header, archive_path, io::empty())
            .map_err(AppendError::Write)?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(source).map_err(AppendError::read)?;
        let mut header = prepare_header(&metadata).map_err(AppendError::Read)?;
        header.set_size(0);
        builder
            .append_link(&mut header, archive_path, target)
            .map_err(AppendError::Write)?;
    } else {
        tracing::debug!("skipping special file {}", source.display());
        return Ok(false);
    }

    Ok(true)
}

/// Builds a header from the metadata of an entry, keeping ownership and
/// timestamps but not device numbers.
fn prepare_header(metadata: &Metadata) -> io::Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(metadata, tar::HeaderMode::Complete);
    header.set_device_major(0)?;
    header.set_device_minor(0)?;
    Ok(header)
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &Path) -> io::Result<()> {
    append_fixed(builder, path, tar::EntryType::Regular, 0o644)
}

/// Appends an empty entry owned by root with a zero mtime.
fn append_fixed<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    entry_type: tar::EntryType,
    mode: u32,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(0);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    builder.append_data(&mut header, path, io::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                String::from_utf8(entry.path_bytes().into_owned())
                    .unwrap()
                    .trim_end_matches('/')
                    .to_owned()
            })
            .collect()
    }

    #[test]
    fn test_snapshot_before_init_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut snapshotter = Snapshotter::new(temp_dir.path(), Vec::new());
        assert_matches!(
            snapshotter.write_snapshot(Vec::new()),
            Err(SnapshotError::NotInitialized)
        );
        assert_matches!(snapshotter.changes(), Err(SnapshotError::NotInitialized));
    }

    #[test]
    fn test_parents_of_changes_are_included() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/old"), "old").unwrap();
        std::fs::write(root.join("untouched"), "").unwrap();

        let mut snapshotter = Snapshotter::new(root, Vec::new());
        snapshotter.init().unwrap();

        std::fs::write(root.join("a/b/new"), "new").unwrap();
        std::fs::remove_file(root.join("a/b/old")).unwrap();

        let mut archive = Vec::new();
        let summary = snapshotter.write_snapshot(&mut archive).unwrap();

        assert_eq!(entry_names(&archive), vec!["a", "a/b", "a/b/.wh.old", "a/b/new"]);
        assert_eq!(
            summary,
            SnapshotSummary {
                added: 1,
                modified: 0,
                deleted: 1,
                entries: 4,
            }
        );
    }

    #[test]
    fn test_whiteout_headers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("gone"), "bye").unwrap();

        let mut snapshotter = Snapshotter::new(root, Vec::new());
        snapshotter.init().unwrap();
        std::fs::remove_file(root.join("gone")).unwrap();

        let mut archive = Vec::new();
        snapshotter.write_snapshot(&mut archive).unwrap();

        let mut archive = tar::Archive::new(archive.as_slice());
        let entries: Vec<_> = archive.entries().unwrap().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 1);
        let header = entries[0].header();
        assert_eq!(&*entries[0].path_bytes(), b".wh.gone");
        assert_eq!(header.entry_type(), tar::EntryType::Regular);
        assert_eq!(header.size().unwrap(), 0);
        assert_eq!(header.mode().unwrap(), 0o644);
        assert_eq!(header.uid().unwrap(), 0);
        assert_eq!(header.gid().unwrap(), 0);
        assert_eq!(header.mtime().unwrap(), 0);
    }

    #[test]
    fn test_successful_snapshot_replaces_baseline() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        let mut snapshotter = Snapshotter::new(root, Vec::new());
        snapshotter.init().unwrap();

        std::fs::write(root.join("file"), "content").unwrap();
        snapshotter.write_snapshot(Vec::new()).unwrap();
        assert!(snapshotter.baseline().unwrap().contains(Path::new("file")));

        let mut archive = Vec::new();
        let summary = snapshotter.write_snapshot(&mut archive).unwrap();
        assert_eq!(summary, SnapshotSummary::default());
        assert!(entry_names(&archive).is_empty());
    }

    #[test]
    fn test_failed_snapshot_keeps_baseline() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let mut snapshotter = Snapshotter::new(&root, Vec::new());
        snapshotter.init().unwrap();

        std::fs::write(root.join("file"), "content").unwrap();
        let destination = temp_dir.path().join("missing-dir/layer.tar");
        assert_matches!(
            snapshotter.take_snapshot(&destination),
            Err(SnapshotError::Write { path, .. }) if path == destination
        );

        assert!(!snapshotter.baseline().unwrap().contains(Path::new("file")));
        assert_eq!(snapshotter.changes().unwrap().added, vec![PathBuf::from("file")]);
    }

    #[test]
    fn test_relative_root_keeps_absolute_ignores() {
        let temp_dir = tempfile::tempdir_in(".").unwrap();
        let cwd = std::env::current_dir().unwrap();
        let root = temp_dir.path().strip_prefix(&cwd).unwrap();
        assert!(root.is_relative());
        std::fs::create_dir(root.join("layers")).unwrap();

        let options = SnapshotterOptions::new(root).ignore(cwd.join(root).join("layers"));
        let mut snapshotter = Snapshotter::from_options(options);
        assert!(snapshotter.root_dir().is_absolute());
        snapshotter.init().unwrap();

        std::fs::write(root.join("layers/file-to-ignore"), "").unwrap();
        std::fs::write(root.join("captured"), "").unwrap();

        let mut archive = Vec::new();
        snapshotter.write_snapshot(&mut archive).unwrap();
        assert_eq!(entry_names(&archive), vec!["captured"]);
    }

    #[test]
    fn test_paths_vanishing_before_they_are_written() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("existing"), "before").unwrap();

        let mut snapshotter = Snapshotter::new(root, Vec::new());
        snapshotter.init().unwrap();

        std::fs::write(root.join("existing"), "after, and longer").unwrap();
        std::fs::create_dir(root.join("fresh")).unwrap();
        std::fs::write(root.join("fresh/child"), "child").unwrap();
        let current = scan(root, &[]).unwrap();

        std::fs::remove_file(root.join("existing")).unwrap();
        std::fs::remove_dir_all(root.join("fresh")).unwrap();

        let baseline = snapshotter.baseline().unwrap();
        let (archive, summary) = snapshotter
            .write_layer(baseline, &current, Vec::new(), None)
            .unwrap();

        // Only the path known to the baseline needs a whiteout.
        assert_eq!(entry_names(&archive), vec![".wh.existing"]);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.entries, 1);
    }

    struct FailingFlush;

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("flush failed"))
        }
    }

    #[test]
    fn test_failing_writer_keeps_baseline() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        let mut snapshotter = Snapshotter::new(root, Vec::new());
        snapshotter.init().unwrap();

        std::fs::write(root.join("file"), "content").unwrap();
        assert_matches!(
            snapshotter.write_snapshot(FailingFlush),
            Err(SnapshotError::Finish(_))
        );
        assert!(!snapshotter.baseline().unwrap().contains(Path::new("file")));
    }

    #[test]
    fn test_relative_ignores_resolve_against_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        let snapshotter = Snapshotter::from_options(SnapshotterOptions::new(root).ignore("layers"));
        assert_eq!(snapshotter.ignored_paths(), &[root.join("layers")]);
    }
}
