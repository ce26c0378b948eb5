#![deny(missing_docs)]

//! Captures the changes made below a directory as an OCI layer archive.
//!
//! A [`Snapshotter`] records a baseline of the watched root with
//! [`Snapshotter::init`]. After the build step ran,
//! [`Snapshotter::take_snapshot`] compares the root against the baseline and
//! writes an archive containing every added or modified path and a whiteout
//! entry for every deleted path. Paths in the ignore set, and optionally
//! every mount point below the root, are never looked at.

use std::path::PathBuf;

mod diff;
mod fingerprint;
mod ignore;
mod inventory;
mod snapshotter;

pub use diff::Changes;
pub use fingerprint::{EntryKind, Fingerprint};
pub use ignore::{
    parse_mount_points, IgnoreListProvider, MountInfoIgnoreList, NoIgnoreList, StaticIgnoreList,
    DEFAULT_MOUNTINFO_PATH,
};
pub use inventory::Inventory;
pub use snapshotter::{SnapshotSummary, Snapshotter, SnapshotterOptions};

/// An error that can occur while snapshotting a directory.
#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    /// The watched root, or a path below it, could not be read.
    #[error("failed to scan {}", path.display())]
    Scan {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The layer archive could not be written.
    #[error("failed to write snapshot to {}", path.display())]
    Write {
        /// The archive, or the entry that could not be written to it.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The archive could not be completed on a writer that has no path.
    #[error("failed to finish the snapshot archive")]
    Finish(#[source] std::io::Error),

    /// A snapshot was requested before a baseline was recorded.
    #[error("the snapshotter has not been initialized")]
    NotInitialized,
}
