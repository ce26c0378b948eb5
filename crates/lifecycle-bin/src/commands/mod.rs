pub mod extract;
pub mod snapshot;

use lifecycle_archive::Platform;

/// The filesystem layout of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LayoutArg {
    /// A single tree, the destination is required when extracting
    Posix,
    /// The split `Hives`/`Files` layout, the destination defaults to `c:\`
    Windows,
}

impl From<LayoutArg> for Platform {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Posix => Platform::Posix,
            LayoutArg::Windows => Platform::Windows,
        }
    }
}
