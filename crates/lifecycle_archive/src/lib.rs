#![deny(missing_docs)]

//! Reading and applying image layer archives.
//!
//! A layer archive is a tar stream whose entry names are rewritten on the
//! way to disk by a [`PathNormalizer`]: leading labels are stripped,
//! excluded prefixes are dropped, the [`LayoutStrategy`] converts the name
//! into its on-disk form and the destination root is prepended.
//! [`NormalizingTarReader`] applies a normalizer while streaming entries and
//! [`Extractor`] drives it to unpack a layer, honouring whiteout entries.

pub mod extract;
pub mod normalize;
pub mod reader;
pub mod whiteout;

#[cfg(test)]
mod test_utils;

pub use extract::{extract, ExtractError, ExtractSummary, Extractor, Platform};
pub use normalize::{
    EntryTransform, Exclude, LayoutStrategy, NormalizeError, NormalizedPath, PathNormalizer,
    PosixLayout, SplitLayerLayout, SplitLayout, Strip, FILES_DIR, HIVES_DIR,
};
pub use reader::{NormalizedEntries, NormalizedEntry, NormalizingTarReader, TransformError};
pub use whiteout::{whiteout_path, Whiteout, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
