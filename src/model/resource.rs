use super::error::Result;
use super::handle::Handle;
use super::manager::SourceManager;
use super::mime::{self as types, OCTET_STREAM};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, SpooledTempFile};

/// A handle bound to the sessions of a [`SourceManager`].
///
/// Every accessor is best-effort: `Ok(None)` or an empty map means the value
/// is not available for this kind of object. Whether the object still exists
/// is answered by [`Resource::check`] alone.
pub struct Resource<'a> {
    handle: Handle,
    sm: &'a SourceManager,
}

impl<'a> Resource<'a> {
    pub(crate) fn new(handle: Handle, sm: &'a SourceManager) -> Self {
        Self { handle, sm }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn manager(&self) -> &'a SourceManager {
        self.sm
    }

    /// Typed cookie of the source this resource's handle belongs to.
    pub fn cookie<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        self.sm.open_as::<T>(self.handle.source_arc())
    }

    /// Whether the object is still present in its source.
    pub fn check(&self) -> Result<bool> {
        self.handle.source().driver().check(self)
    }

    pub fn make_stream(&self) -> Result<ContentStream> {
        self.handle.source().driver().stream(self)
    }

    /// A filesystem path with the object's content, materialized into a
    /// temporary file when the object has no path of its own.
    pub fn make_path(&self) -> Result<LocalPath> {
        self.handle.source().driver().local_path(self)
    }

    pub fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.handle.source().driver().last_modified(self)
    }

    pub fn hash(&self) -> Result<Option<String>> {
        self.handle.source().driver().hash(self)
    }

    pub fn size(&self) -> Result<Option<u64>> {
        self.handle.source().driver().size(self)
    }

    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        self.handle.source().driver().metadata(self)
    }

    /// The content type: the handle's guess, refined by looking at the first
    /// bytes when the name says nothing.
    pub fn compute_type(&self) -> Result<String> {
        let guess = self
            .handle
            .guess_type()
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        if guess != OCTET_STREAM {
            return Ok(guess);
        }

        let mut head = Vec::with_capacity(512);
        self.make_stream()?.take(512).read_to_end(&mut head)?;
        Ok(types::sniff(&head).map(str::to_string).unwrap_or(guess))
    }
}

/// Readable content of a resource.
pub enum ContentStream {
    File(File),
    Memory(Cursor<bytes::Bytes>),
    Spooled(SpooledTempFile),
}

impl ContentStream {
    pub fn from_bytes(bytes: impl Into<bytes::Bytes>) -> Self {
        ContentStream::Memory(Cursor::new(bytes.into()))
    }

    /// Copies `reader` into a buffer that moves to disk past `threshold`
    /// bytes, rewound and ready for reading.
    pub fn spool(reader: &mut impl Read, threshold: usize) -> io::Result<Self> {
        let mut spooled = SpooledTempFile::new(threshold);
        io::copy(reader, &mut spooled)?;
        spooled.seek(SeekFrom::Start(0))?;
        Ok(ContentStream::Spooled(spooled))
    }

    pub fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ContentStream::File(f) => f.read(buf),
            ContentStream::Memory(c) => c.read(buf),
            ContentStream::Spooled(s) => s.read(buf),
        }
    }
}

/// A path to a resource's content that stays valid while this value lives.
///
/// Temporary copies are deleted when the value is dropped or closed.
#[derive(Debug)]
pub enum LocalPath {
    Existing(PathBuf),
    Temporary(NamedTempFile),
}

impl LocalPath {
    /// Writes `reader` to a new temporary file named with `extension`.
    pub fn materialize(reader: &mut impl Read, extension: Option<String>) -> Result<Self> {
        let suffix = extension.map(|ext| format!(".{ext}")).unwrap_or_default();
        let mut file = tempfile::Builder::new()
            .prefix("nestscan-")
            .suffix(&suffix)
            .tempfile()?;
        io::copy(reader, &mut file)?;
        file.flush()?;
        Ok(LocalPath::Temporary(file))
    }

    pub fn path(&self) -> &Path {
        match self {
            LocalPath::Existing(path) => path,
            LocalPath::Temporary(file) => file.path(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, LocalPath::Temporary(_))
    }

    /// Removes a temporary copy now, reporting failure instead of ignoring it.
    pub fn close(self) -> io::Result<()> {
        match self {
            LocalPath::Existing(_) => Ok(()),
            LocalPath::Temporary(file) => file.close(),
        }
    }
}

impl AsRef<Path> for LocalPath {
    fn as_ref(&self) -> &Path {
        self.path()
    }
}
