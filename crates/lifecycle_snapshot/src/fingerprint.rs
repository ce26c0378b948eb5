use std::fs::Metadata;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use fs_err as fs;
use xxhash_rust::xxh3::Xxh3;

/// Size of the buffer used to hash file contents.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// The type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link, which is never followed.
    Symlink,
    /// Sockets, pipes and device nodes.
    Other,
}

impl EntryKind {
    fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

/// Everything about a path that decides whether it changed between two
/// scans.
///
/// The modification time is not part of the fingerprint: rewriting a file
/// with identical content and permissions is not a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// The type of the entry.
    pub kind: EntryKind,
    /// Permission bits.
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Size of a regular file, zero for everything else.
    pub size: u64,
    /// xxh3 hash of the contents of a regular file.
    pub content_hash: Option<u64>,
    /// Target of a symbolic link.
    pub link_target: Option<PathBuf>,
}

impl Fingerprint {
    /// Fingerprints the entry at `path` without following symlinks.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        let kind = EntryKind::from_metadata(&metadata);
        let (mode, uid, gid) = ownership(&metadata);

        let (size, content_hash, link_target) = match kind {
            EntryKind::File => (metadata.len(), Some(hash_file(path)?), None),
            EntryKind::Symlink => (0, None, Some(fs::read_link(path)?)),
            EntryKind::Directory | EntryKind::Other => (0, None, None),
        };

        Ok(Self {
            kind,
            mode,
            uid,
            gid,
            size,
            content_hash,
            link_target,
        })
    }

    /// Returns true if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

#[cfg(unix)]
fn ownership(metadata: &Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.mode() & 0o7777, metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn ownership(metadata: &Metadata) -> (u32, u32, u32) {
    let mode = if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    };
    (mode, 0, 0)
}

/// Computes the xxh3 hash of the contents of a file.
fn hash_file(path: &Path) -> io::Result<u64> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(hasher.digest())
}
