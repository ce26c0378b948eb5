#![deny(missing_docs)]

//! Environments for build and launch processes.
//!
//! Layers contribute to the environment of the processes that run on top of
//! them in two ways: the well known directories of a layer (`bin`, `lib`,
//! ...) are added to search path variables with
//! [`RootDirEnv::add_root_dir`], and files in an `env` directory set or
//! extend variables with [`Env::add_env_dir`].

use std::path::{Path, PathBuf};

mod env;

pub use env::{
    posix_build_env, posix_launch_env, windows_env, Env, RootDirMap, LAUNCH_EXCLUDED_VARS,
};

/// Folds the well known directories below a root into search path
/// variables.
pub trait RootDirEnv {
    /// Prepends every mapped subdirectory of `dir` that exists to the
    /// variables it is mapped to.
    fn add_root_dir(&mut self, dir: &Path) -> Result<(), EnvError>;
}

/// An error that can occur while assembling an environment.
#[derive(thiserror::Error, Debug)]
pub enum EnvError {
    /// A directory or variable file could not be read.
    #[error("failed to read {}", path.display())]
    Io {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}
