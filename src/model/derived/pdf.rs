//! PDF documents, split into pages by the poppler command-line tools.
//!
//! A [`PdfSource`] yields one handle per page. Each page handle is itself a
//! container: a [`PdfPageSource`] extracts the page's text and embedded
//! images into a temporary directory and yields one handle per file.

use super::parent_missing;
use crate::model::error::{ModelError, Result};
use crate::model::handle::Handle;
use crate::model::manager::{Cookie, SourceManager};
use crate::model::resource::{ContentStream, LocalPath, Resource};
use crate::model::source::{HandleIter, Source, SourceDriver};
use crate::subprocess;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdfSource {
    pub handle: Handle,
}

impl PdfSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

struct PdfCookie {
    local: LocalPath,
    pages: u32,
    info: BTreeMap<String, String>,
}

impl PdfCookie {
    fn page_number(&self, relative_path: &str) -> Option<u32> {
        relative_path
            .parse::<u32>()
            .ok()
            .filter(|n| (1..=self.pages).contains(n))
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        ["ModDate", "CreationDate"]
            .iter()
            .filter_map(|key| self.info.get(*key))
            .find_map(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Parses the `Key: value` report printed by `pdfinfo`.
fn parse_info(report: &str) -> BTreeMap<String, String> {
    report
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

impl SourceDriver for PdfSource {
    fn open(&self, sm: &SourceManager) -> Result<Cookie> {
        let local = self.handle.follow(sm).make_path()?;
        let output = subprocess::run(
            "pdfinfo",
            [
                OsStr::new("-isodates"),
                local.path().as_os_str(),
            ],
            sm.settings().subprocess_timeout,
        )?;

        let info = parse_info(&String::from_utf8_lossy(&output.stdout));
        let pages = info
            .get("Pages")
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| ModelError::malformed("pdf", "pdfinfo reported no page count"))?;
        debug!(pdf = %self.handle, pages, "Opened PDF");

        Ok(Arc::new(PdfCookie { local, pages, info }))
    }

    fn handles(&self, this: &Arc<Source>, cookie: Cookie) -> Result<HandleIter> {
        let pages = cookie
            .downcast::<PdfCookie>()
            .map_err(|_| ModelError::CookieType("pdf"))?
            .pages;
        let source = Arc::clone(this);
        Ok(Box::new(
            (1..=pages).map(move |page| Ok(Handle::new(Arc::clone(&source), page.to_string()))),
        ))
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool> {
        match res.cookie::<PdfCookie>() {
            Ok(cookie) => Ok(cookie.page_number(res.handle().relative_path()).is_some()),
            Err(err) if parent_missing(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// The plain text of the page.
    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream> {
        let cookie = res.cookie::<PdfCookie>()?;
        let page = cookie
            .page_number(res.handle().relative_path())
            .ok_or_else(|| ModelError::not_found(res.handle()))?
            .to_string();
        let output = subprocess::run(
            "pdftotext",
            [
                OsStr::new("-q"),
                OsStr::new("-nopgbrk"),
                OsStr::new("-f"),
                OsStr::new(page.as_str()),
                OsStr::new("-l"),
                OsStr::new(page.as_str()),
                cookie.local.path().as_os_str(),
                OsStr::new("-"),
            ],
            res.manager().settings().subprocess_timeout,
        )?;
        Ok(ContentStream::from_bytes(output.stdout))
    }

    fn last_modified(&self, res: &Resource<'_>) -> Result<Option<DateTime<Utc>>> {
        let cookie = res.cookie::<PdfCookie>()?;
        match cookie.modified() {
            Some(ts) => Ok(Some(ts)),
            None => self.handle.follow(res.manager()).last_modified(),
        }
    }

    fn metadata(&self, res: &Resource<'_>) -> Result<BTreeMap<String, String>> {
        let cookie = res.cookie::<PdfCookie>()?;
        let mut metadata = BTreeMap::new();
        for (key, name) in [("Author", "pdf-author"), ("Title", "pdf-title")] {
            if let Some(value) = cookie.info.get(key).filter(|v| !v.is_empty()) {
                metadata.insert(name.to_string(), value.clone());
            }
        }
        Ok(metadata)
    }
}

/// The text and images of a single PDF page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdfPageSource {
    pub handle: Handle,
}

impl PdfPageSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

struct PageCookie {
    dir: TempDir,
    names: Arc<Vec<String>>,
}

impl PageCookie {
    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

impl SourceDriver for PdfPageSource {
    fn open(&self, sm: &SourceManager) -> Result<Cookie> {
        let pdf = sm.open_as::<PdfCookie>(self.handle.source_arc())?;
        let page = pdf
            .page_number(self.handle.relative_path())
            .ok_or_else(|| ModelError::not_found(&self.handle))?
            .to_string();
        let timeout = sm.settings().subprocess_timeout;
        let dir = tempfile::Builder::new().prefix("nestscan-page-").tempdir()?;

        let text_out = dir.path().join("page.txt");
        subprocess::run(
            "pdftotext",
            [
                OsStr::new("-q"),
                OsStr::new("-nopgbrk"),
                OsStr::new("-eol"),
                OsStr::new("unix"),
                OsStr::new("-f"),
                OsStr::new(page.as_str()),
                OsStr::new("-l"),
                OsStr::new(page.as_str()),
                pdf.local.path().as_os_str(),
                text_out.as_os_str(),
            ],
            timeout,
        )?;

        if !sm.settings().skip_images {
            let image_root = dir.path().join("image");
            subprocess::run(
                "pdfimages",
                [
                    OsStr::new("-q"),
                    OsStr::new("-png"),
                    OsStr::new("-j"),
                    OsStr::new("-f"),
                    OsStr::new(page.as_str()),
                    OsStr::new("-l"),
                    OsStr::new(page.as_str()),
                    pdf.local.path().as_os_str(),
                    image_root.as_os_str(),
                ],
                timeout,
            )?;
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(dir.path())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        Ok(Arc::new(PageCookie {
            dir,
            names: Arc::new(names),
        }))
    }

    fn handles(&self, this: &Arc<Source>, cookie: Cookie) -> Result<HandleIter> {
        let names = Arc::clone(
            &cookie
                .downcast::<PageCookie>()
                .map_err(|_| ModelError::CookieType("pdf-page"))?
                .names,
        );
        let source = Arc::clone(this);
        Ok(Box::new(
            (0..names.len()).map(move |i| Ok(Handle::new(Arc::clone(&source), names[i].clone()))),
        ))
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool> {
        match res.cookie::<PageCookie>() {
            Ok(cookie) => Ok(cookie.contains(res.handle().relative_path())),
            Err(err) if parent_missing(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream> {
        let cookie = res.cookie::<PageCookie>()?;
        let name = res.handle().relative_path();
        if !cookie.contains(name) {
            return Err(ModelError::not_found(res.handle()));
        }
        Ok(ContentStream::File(File::open(cookie.dir.path().join(name))?))
    }

    fn size(&self, res: &Resource<'_>) -> Result<Option<u64>> {
        let cookie = res.cookie::<PageCookie>()?;
        let path = cookie.dir.path().join(res.handle().relative_path());
        Ok(fs::metadata(path).ok().map(|m| m.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FilesystemSource;
    use crate::model::derived::ZipSource;

    #[test]
    fn test_parse_pdfinfo_report() {
        let report = "Title:          Quarterly report\n\
                      Author:         Jane Roe\n\
                      CreationDate:   2021-03-04T05:06:07+01:00\n\
                      Pages:          3\n\
                      Encrypted:      no\n";
        let info = parse_info(report);
        assert_eq!(info.get("Pages").map(String::as_str), Some("3"));
        assert_eq!(info.get("Author").map(String::as_str), Some("Jane Roe"));
        // Values may contain the separator themselves.
        assert_eq!(
            info.get("CreationDate").map(String::as_str),
            Some("2021-03-04T05:06:07+01:00")
        );
    }

    #[test]
    fn test_page_numbers_are_bounded() {
        let cookie = PdfCookie {
            local: LocalPath::Existing("/nonexistent.pdf".into()),
            pages: 2,
            info: BTreeMap::from([("ModDate".to_string(), "2020-01-02T03:04:05Z".to_string())]),
        };
        assert_eq!(cookie.page_number("1"), Some(1));
        assert_eq!(cookie.page_number("2"), Some(2));
        assert_eq!(cookie.page_number("0"), None);
        assert_eq!(cookie.page_number("3"), None);
        assert_eq!(cookie.page_number("x"), None);
        assert!(cookie.modified().is_some());
    }

    fn pdf_in_zip() -> Arc<Source> {
        let root = Arc::new(Source::File(FilesystemSource::new("/scans")));
        let zip = Arc::new(Source::Zip(ZipSource::new(Handle::new(root, "archive.zip"))));
        Arc::new(Source::Pdf(PdfSource::new(Handle::new(zip, "doc.pdf"))))
    }

    #[test]
    fn test_pages_of_pdf_in_zip() {
        let pdf = pdf_in_zip();
        let Source::Pdf(driver) = pdf.as_ref() else {
            unreachable!()
        };
        let cookie: Cookie = Arc::new(PdfCookie {
            local: LocalPath::Existing("/nonexistent.pdf".into()),
            pages: 3,
            info: BTreeMap::new(),
        });

        let pages: Vec<Handle> = driver
            .handles(&pdf, cookie)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pages.len(), 3);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.type_label(), "pdf-page");
            assert_eq!(page.presentation_name(), format!("page {}", i + 1));
            assert_eq!(
                page.to_string(),
                format!("page {} of doc.pdf (file doc.pdf of archive.zip)", i + 1)
            );
            assert_eq!(page.base_handle().relative_path(), "archive.zip");
        }

        let objects = Arc::new(Source::PdfPage(PdfPageSource::new(pages[1].clone())));
        assert_eq!(
            Handle::new(objects.clone(), "page.txt").to_string(),
            "text on page 2 of doc.pdf (file doc.pdf of archive.zip)"
        );
        assert_eq!(
            Handle::new(objects, "image-000.png").to_string(),
            "image on page 2 of doc.pdf (file doc.pdf of archive.zip)"
        );
    }
}
