//! Mapping from content types to the derived sources that can explore them.

use super::derived::{MailSource, PdfPageSource, PdfSource, TarSource, ZipSource};
use super::error::{ModelError, Result};
use super::handle::Handle;
use super::manager::SourceManager;
use super::mime::PAGE_TYPE;
use super::source::Source;
use std::collections::BTreeMap;
use tracing::debug;

/// Builds a derived source around a handle.
pub type Constructor = fn(Handle) -> Source;

/// Explicit registry of derived source constructors, keyed by MIME type.
///
/// The `None` key is a wildcard consulted only when no exact entry exists.
#[derive(Debug, Clone, Default)]
pub struct DerivedSourceTable {
    entries: BTreeMap<Option<String>, Constructor>,
}

impl DerivedSourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every container format the model understands.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        let defaults: [(&str, Constructor); 5] = [
            ("application/zip", |h| Source::Zip(ZipSource::new(h))),
            ("application/x-tar", |h| Source::Tar(TarSource::new(h))),
            ("application/pdf", |h| Source::Pdf(PdfSource::new(h))),
            (PAGE_TYPE, |h| Source::PdfPage(PdfPageSource::new(h))),
            ("message/rfc822", |h| Source::Mail(MailSource::new(h))),
        ];
        for (mime, constructor) in defaults {
            table.entries.insert(Some(mime.to_string()), constructor);
        }
        table
    }

    /// Adds a constructor for `mime` (or the wildcard when `None`).
    ///
    /// Registering a second constructor for the same key is an error.
    pub fn register(&mut self, mime: Option<&str>, constructor: Constructor) -> Result<()> {
        let key = mime.map(str::to_string);
        if self.entries.contains_key(&key) {
            return Err(ModelError::DuplicateDerived(
                mime.unwrap_or("*").to_string(),
            ));
        }
        self.entries.insert(key, constructor);
        Ok(())
    }

    pub fn lookup(&self, mime: &str) -> Option<Constructor> {
        self.entries
            .get(&Some(mime.to_string()))
            .or_else(|| self.entries.get(&None))
            .copied()
    }

    pub fn mime_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().filter_map(|k| k.as_deref())
    }

    /// Wraps `handle` in a derived source if its content type has an entry.
    pub fn derive(&self, handle: &Handle, sm: &SourceManager) -> Result<Option<Source>> {
        let mime = handle.follow(sm).compute_type()?;
        let derived = self.lookup(&mime).map(|constructor| constructor(handle.clone()));
        if let Some(source) = &derived {
            debug!(handle = %handle, mime = %mime, source = source.type_label(), "Derived source");
        }
        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::data::DataSource;
    use std::sync::Arc;

    fn handle(name: &str) -> Handle {
        let source = Source::Data(DataSource::new(Vec::new(), "text/plain", Some(name.into())));
        Handle::new(Arc::new(source), "file")
    }

    #[test]
    fn test_exact_lookup() {
        let table = DerivedSourceTable::with_defaults();
        let constructor = table.lookup("application/zip").unwrap();
        assert!(matches!(constructor(handle("a.zip")), Source::Zip(_)));
        assert!(table.lookup("text/plain").is_none());
    }

    #[test]
    fn test_wildcard_fallback() {
        let mut table = DerivedSourceTable::new();
        table
            .register(None, |h| Source::Tar(TarSource::new(h)))
            .unwrap();
        let constructor = table.lookup("application/anything").unwrap();
        assert!(matches!(constructor(handle("x")), Source::Tar(_)));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut table = DerivedSourceTable::with_defaults();
        let result = table.register(Some("application/zip"), |h| Source::Zip(ZipSource::new(h)));
        assert!(matches!(result, Err(ModelError::DuplicateDerived(m)) if m == "application/zip"));
    }
}
