//! Naming of whiteout entries.
//!
//! A whiteout is a zero length entry named `<parent>/.wh.<name>` that marks
//! `<parent>/<name>` as deleted in the layer. The special name
//! `.wh..wh..opq` marks its parent directory as opaque: every child that
//! existed before the layer was applied is removed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Prefix of the file name of a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// File name of an opaque whiteout entry.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// The meaning of a whiteout file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whiteout<'a> {
    /// The sibling with this name is deleted.
    Path(&'a str),

    /// All pre-existing children of the parent directory are deleted.
    Opaque,
}

/// Interprets a file name as a whiteout marker.
///
/// Returns `None` for regular names and for markers that do not name a
/// sibling (`.wh.`, `.wh..`, `.wh...`).
pub fn parse_whiteout(file_name: &str) -> Option<Whiteout<'_>> {
    if file_name == OPAQUE_WHITEOUT {
        return Some(Whiteout::Opaque);
    }
    match file_name.strip_prefix(WHITEOUT_PREFIX)? {
        "" | "." | ".." => None,
        name => Some(Whiteout::Path(name)),
    }
}

/// Returns the name of the whiteout entry that deletes `path`.
///
/// Returns `None` if `path` has no file name.
pub fn whiteout_path(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let mut name = OsString::from(WHITEOUT_PREFIX);
    name.push(file_name);
    Some(match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    })
}
