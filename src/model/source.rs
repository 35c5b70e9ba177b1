use super::data::DataSource;
use super::derived::{MailSource, PdfPageSource, PdfSource, TarSource, ZipSource};
use super::error::Result;
use super::file::FilesystemSource;
use super::handle::Handle;
use super::manager::{Cookie, SourceManager};
use super::resource::{ContentStream, LocalPath, Resource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

/// Lazy sequence of the handles below one source.
pub type HandleIter = Box<dyn Iterator<Item = Result<Handle>> + Send>;

/// A location that can enumerate handles. Root variants describe something
/// outside the process; derived variants reinterpret the content of another
/// handle as a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Source {
    File(FilesystemSource),
    Data(DataSource),
    Zip(ZipSource),
    Tar(TarSource),
    Pdf(PdfSource),
    PdfPage(PdfPageSource),
    Mail(MailSource),
}

impl Source {
    /// Label of the source itself, as used in the `type` field on the wire.
    pub fn type_label(&self) -> &'static str {
        match self {
            Source::File(_) => "file",
            Source::Data(_) => "data",
            Source::Zip(_) => "zip",
            Source::Tar(_) => "tar",
            Source::Pdf(_) => "pdf",
            Source::PdfPage(_) => "pdf-page",
            Source::Mail(_) => "mail",
        }
    }

    /// Label of the handles this source yields.
    pub fn handle_label(&self) -> &'static str {
        match self {
            Source::File(_) => "file",
            Source::Data(_) => "data",
            Source::Zip(_) => "zip",
            Source::Tar(_) => "tar",
            Source::Pdf(_) => "pdf-page",
            Source::PdfPage(_) => "pdf-object",
            Source::Mail(_) => "mail-part",
        }
    }

    /// The handle a derived source was built from.
    pub fn parent(&self) -> Option<&Handle> {
        match self {
            Source::File(_) | Source::Data(_) => None,
            Source::Zip(s) => Some(&s.handle),
            Source::Tar(s) => Some(&s.handle),
            Source::Pdf(s) => Some(&s.handle),
            Source::PdfPage(s) => Some(&s.handle),
            Source::Mail(s) => Some(&s.handle),
        }
    }

    /// A copy safe to write to logs and result messages: inline content and
    /// anything nested below it is dropped.
    pub fn censor(&self) -> Source {
        match self {
            Source::File(s) => Source::File(s.clone()),
            Source::Data(s) => Source::Data(s.censor()),
            Source::Zip(s) => Source::Zip(ZipSource::new(s.handle.censor())),
            Source::Tar(s) => Source::Tar(TarSource::new(s.handle.censor())),
            Source::Pdf(s) => Source::Pdf(PdfSource::new(s.handle.censor())),
            Source::PdfPage(s) => Source::PdfPage(PdfPageSource::new(s.handle.censor())),
            Source::Mail(s) => Source::Mail(MailSource::new(s.handle.censor())),
        }
    }

    /// Number of derived layers above the root source.
    pub fn depth(&self) -> usize {
        self.parent().map_or(0, |h| h.source().depth() + 1)
    }

    pub(crate) fn driver(&self) -> &dyn SourceDriver {
        match self {
            Source::File(s) => s,
            Source::Data(s) => s,
            Source::Zip(s) => s,
            Source::Tar(s) => s,
            Source::Pdf(s) => s,
            Source::PdfPage(s) => s,
            Source::Mail(s) => s,
        }
    }

    /// Enumerates the handles of this source, opening it through `sm` if it
    /// is not already open.
    pub fn handles(self: &Arc<Self>, sm: &SourceManager) -> Result<HandleIter> {
        let cookie = sm.open(self)?;
        self.driver().handles(self, cookie)
    }
}

/// Per-variant behaviour behind [`Source`], [`Handle`] and [`Resource`].
///
/// Cookies are produced by `open` and handed back by the manager; drivers
/// never keep them anywhere else.
pub(crate) trait SourceDriver {
    fn open(&self, sm: &SourceManager) -> Result<Cookie>;

    fn handles(&self, this: &Arc<Source>, cookie: Cookie) -> Result<HandleIter>;

    fn close(&self, cookie: Cookie) {
        drop(cookie);
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool>;

    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream>;

    fn local_path(&self, res: &Resource<'_>) -> Result<LocalPath> {
        let mut stream = self.stream(res)?;
        LocalPath::materialize(&mut stream, res.handle().extension())
    }

    fn last_modified(&self, res: &Resource<'_>) -> Result<Option<DateTime<Utc>>> {
        match res.handle().source().parent() {
            Some(parent) => parent.follow(res.manager()).last_modified(),
            None => Ok(None),
        }
    }

    fn hash(&self, res: &Resource<'_>) -> Result<Option<String>> {
        let mut stream = self.stream(res)?;
        Ok(Some(sha256_hex(&mut stream)?))
    }

    fn size(&self, res: &Resource<'_>) -> Result<Option<u64>> {
        let mut stream = self.stream(res)?;
        Ok(Some(std::io::copy(&mut stream, &mut std::io::sink())?))
    }

    fn metadata(&self, _res: &Resource<'_>) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

pub(crate) fn sha256_hex(reader: &mut impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
