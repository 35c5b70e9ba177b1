use super::parent_missing;
use crate::model::error::{ModelError, Result};
use crate::model::handle::Handle;
use crate::model::manager::{Cookie, SourceManager};
use crate::model::mime::OCTET_STREAM;
use crate::model::resource::{ContentStream, Resource};
use crate::model::source::{HandleIter, Source, SourceDriver, sha256_hex};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The leaf parts of an RFC 822 message: body text and attachments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailSource {
    pub handle: Handle,
}

impl MailSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

struct MailPart {
    path: String,
    mime: String,
    body: Bytes,
}

struct MailCookie {
    parts: Arc<Vec<MailPart>>,
    headers: BTreeMap<String, String>,
    date: Option<DateTime<Utc>>,
}

impl MailCookie {
    fn part(&self, path: &str) -> Option<&MailPart> {
        self.parts.iter().find(|p| p.path == path)
    }
}

fn collect_parts(mail: &ParsedMail<'_>, chain: String, out: &mut Vec<MailPart>) -> Result<()> {
    if !mail.subparts.is_empty() {
        for (i, sub) in mail.subparts.iter().enumerate() {
            collect_parts(sub, format!("{chain}.{i}"), out)?;
        }
        return Ok(());
    }

    let disposition = mail.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| mail.ctype.params.get("name"))
        .map(|name| name.replace('/', "_"));
    let body = mail
        .get_body_raw()
        .map_err(|e| ModelError::malformed("mail", e))?;

    out.push(MailPart {
        path: format!("{chain}/{}", filename.as_deref().unwrap_or("body")),
        mime: mail.ctype.mimetype.to_ascii_lowercase(),
        body: Bytes::from(body),
    });
    Ok(())
}

impl SourceDriver for MailSource {
    fn open(&self, sm: &SourceManager) -> Result<Cookie> {
        let raw = self.handle.follow(sm).make_stream()?.read_all()?;
        let mail = mailparse::parse_mail(&raw).map_err(|e| ModelError::malformed("mail", e))?;

        let mut parts = Vec::new();
        collect_parts(&mail, "0".to_string(), &mut parts)?;

        let mut headers = BTreeMap::new();
        for (name, key) in [("Subject", "email-subject"), ("From", "email-from")] {
            if let Some(value) = mail.headers.get_first_value(name) {
                headers.insert(key.to_string(), value);
            }
        }
        let date = mail
            .headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0));

        Ok(Arc::new(MailCookie {
            parts: Arc::new(parts),
            headers,
            date,
        }))
    }

    fn handles(&self, this: &Arc<Source>, cookie: Cookie) -> Result<HandleIter> {
        let parts = Arc::clone(
            &cookie
                .downcast::<MailCookie>()
                .map_err(|_| ModelError::CookieType("mail"))?
                .parts,
        );
        let source = Arc::clone(this);
        Ok(Box::new((0..parts.len()).map(move |i| {
            let part = &parts[i];
            let handle = Handle::new(Arc::clone(&source), part.path.clone());
            // A generic type says nothing; let the file name decide instead.
            Ok(if part.mime == OCTET_STREAM {
                handle
            } else {
                handle.with_hint(part.mime.clone())
            })
        })))
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool> {
        match res.cookie::<MailCookie>() {
            Ok(cookie) => Ok(cookie.part(res.handle().relative_path()).is_some()),
            Err(err) if parent_missing(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream> {
        let cookie = res.cookie::<MailCookie>()?;
        let part = cookie
            .part(res.handle().relative_path())
            .ok_or_else(|| ModelError::not_found(res.handle()))?;
        Ok(ContentStream::from_bytes(part.body.clone()))
    }

    fn last_modified(&self, res: &Resource<'_>) -> Result<Option<DateTime<Utc>>> {
        let cookie = res.cookie::<MailCookie>()?;
        match cookie.date {
            Some(date) => Ok(Some(date)),
            None => self.handle.follow(res.manager()).last_modified(),
        }
    }

    fn hash(&self, res: &Resource<'_>) -> Result<Option<String>> {
        let cookie = res.cookie::<MailCookie>()?;
        match cookie.part(res.handle().relative_path()) {
            Some(part) => Ok(Some(sha256_hex(&mut part.body.as_ref())?)),
            None => Ok(None),
        }
    }

    fn size(&self, res: &Resource<'_>) -> Result<Option<u64>> {
        let cookie = res.cookie::<MailCookie>()?;
        Ok(cookie
            .part(res.handle().relative_path())
            .map(|p| p.body.len() as u64))
    }

    fn metadata(&self, res: &Resource<'_>) -> Result<BTreeMap<String, String>> {
        Ok(res.cookie::<MailCookie>()?.headers.clone())
    }
}
