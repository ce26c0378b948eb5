//! A tar reader that rewrites entry names while streaming.

use std::fmt;
use std::io::{self, Read};

use crate::normalize::{LayoutStrategy, NormalizeError, NormalizedPath, PathNormalizer};

/// An error that can occur while pulling entries from a
/// [`NormalizingTarReader`].
#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    /// The underlying archive could not be read.
    #[error("failed to read archive entry")]
    Read(#[from] io::Error),

    /// The entry name was rejected.
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

/// Wraps a [`tar::Archive`] and applies a [`PathNormalizer`] to the name of
/// every entry.
///
/// Entries are produced one at a time as the consumer asks for them; the
/// body of an entry is only read when the consumer reads it.
///
/// ```
/// use lifecycle_archive::NormalizingTarReader;
///
/// let archive = tar::Archive::new(std::io::empty());
/// let mut reader = NormalizingTarReader::new(archive)
///     .strip("Files")
///     .exclude_paths(["Hives"])
///     .prepend_dir("/layers/app");
/// assert_eq!(reader.entries().unwrap().count(), 0);
/// ```
pub struct NormalizingTarReader<R: Read> {
    archive: tar::Archive<R>,
    normalizer: PathNormalizer,
}

impl<R: Read> NormalizingTarReader<R> {
    /// Wraps an archive with a normalizer that only canonicalizes names.
    pub fn new(archive: tar::Archive<R>) -> Self {
        Self::with_normalizer(archive, PathNormalizer::new())
    }

    /// Wraps an archive with an explicit normalizer.
    pub fn with_normalizer(archive: tar::Archive<R>, normalizer: PathNormalizer) -> Self {
        Self {
            archive,
            normalizer,
        }
    }

    /// Wraps a raw tar byte stream.
    pub fn from_reader(reader: R) -> Self {
        Self::new(tar::Archive::new(reader))
    }

    /// Strips `label` when it is the first segment of an entry name.
    pub fn strip(mut self, label: impl Into<String>) -> Self {
        self.normalizer = self.normalizer.strip(label);
        self
    }

    /// Skips entries below any of the given prefixes.
    pub fn exclude_paths<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.normalizer = self.normalizer.exclude_paths(prefixes);
        self
    }

    /// Uses the given layout for the on-disk form of entry names.
    pub fn with_layout(mut self, layout: impl LayoutStrategy + 'static) -> Self {
        self.normalizer = self.normalizer.with_layout(layout);
        self
    }

    /// Prepends `destination` to every entry name.
    pub fn prepend_dir(mut self, destination: impl Into<String>) -> Self {
        self.normalizer = self.normalizer.prepend_dir(destination);
        self
    }

    /// The normalizer applied to entry names.
    pub fn normalizer(&self) -> &PathNormalizer {
        &self.normalizer
    }

    /// Returns an iterator over the entries that survive normalization.
    pub fn entries(&mut self) -> io::Result<NormalizedEntries<'_, R>> {
        Ok(NormalizedEntries {
            entries: self.archive.entries()?,
            normalizer: &self.normalizer,
        })
    }

    /// Returns the wrapped archive.
    pub fn into_inner(self) -> tar::Archive<R> {
        self.archive
    }
}

/// Iterator over the entries of a [`NormalizingTarReader`].
pub struct NormalizedEntries<'a, R: 'a + Read> {
    entries: tar::Entries<'a, R>,
    normalizer: &'a PathNormalizer,
}

impl<'a, R: 'a + Read> NormalizedEntries<'a, R> {
    fn normalize_entry(
        &self,
        entry: tar::Entry<'a, R>,
    ) -> Result<Option<NormalizedEntry<'a, R>>, TransformError> {
        let Some(path) = self.normalizer.normalize_bytes(&entry.path_bytes())? else {
            return Ok(None);
        };

        let link_target = if entry.header().entry_type().is_hard_link() {
            match entry.link_name_bytes() {
                Some(name) => self.normalizer.normalize_bytes(&name)?,
                None => None,
            }
        } else {
            None
        };

        Ok(Some(NormalizedEntry {
            entry,
            path,
            link_target,
        }))
    }
}

impl<'a, R: 'a + Read> Iterator for NormalizedEntries<'a, R> {
    type Item = Result<NormalizedEntry<'a, R>, TransformError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(TransformError::Read(err))),
            };

            match self.normalize_entry(entry) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// An archive entry with its rewritten name.
///
/// Reading from this type reads the unmodified body of the entry.
pub struct NormalizedEntry<'a, R: 'a + Read> {
    entry: tar::Entry<'a, R>,
    path: NormalizedPath,
    link_target: Option<NormalizedPath>,
}

impl<'a, R: 'a + Read> NormalizedEntry<'a, R> {
    /// The rewritten name of the entry.
    pub fn path(&self) -> &NormalizedPath {
        &self.path
    }

    /// For hard links, the rewritten name of the entry that is linked to.
    /// `None` for other entry types and for links to excluded entries.
    pub fn link_target(&self) -> Option<&NormalizedPath> {
        self.link_target.as_ref()
    }

    /// The original header of the entry.
    pub fn header(&self) -> &tar::Header {
        self.entry.header()
    }

    /// The type of the entry.
    pub fn entry_type(&self) -> tar::EntryType {
        self.entry.header().entry_type()
    }

    /// The unparsed link target of a symbolic link.
    pub fn link_name(&self) -> io::Result<Option<std::path::PathBuf>> {
        Ok(self.entry.link_name()?.map(|name| name.into_owned()))
    }

    /// Returns the underlying tar entry.
    pub fn into_inner(self) -> tar::Entry<'a, R> {
        self.entry
    }
}

impl<'a, R: 'a + Read> fmt::Debug for NormalizedEntry<'a, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizedEntry")
            .field("path", &self.path)
            .field("entry_type", &self.entry_type())
            .field("link_target", &self.link_target)
            .finish_non_exhaustive()
    }
}

impl<'a, R: 'a + Read> Read for NormalizedEntry<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.entry.read(buf)
    }
}
