use super::parent_missing;
use crate::model::error::{ModelError, Result};
use crate::model::handle::Handle;
use crate::model::manager::{Cookie, SourceManager};
use crate::model::resource::{ContentStream, LocalPath, Resource};
use crate::model::source::{HandleIter, Source, SourceDriver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// Regular-file members of a (non-compressed) tar archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TarSource {
    pub handle: Handle,
}

impl TarSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[derive(Debug, Clone)]
struct TarMember {
    name: String,
    offset: u64,
    size: u64,
    cksum: u32,
    mtime: u64,
}

struct TarCookie {
    local: LocalPath,
    members: Arc<Vec<TarMember>>,
}

impl TarCookie {
    fn member(&self, name: &str) -> Option<&TarMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

impl SourceDriver for TarSource {
    fn open(&self, sm: &SourceManager) -> Result<Cookie> {
        let local = self.handle.follow(sm).make_path()?;
        let mut archive = ::tar::Archive::new(File::open(local.path())?);

        let mut members = Vec::new();
        let entries = archive
            .entries()
            .map_err(|e| ModelError::malformed("tar", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ModelError::malformed("tar", e))?;
            let header = entry.header();
            if !header.entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| ModelError::malformed("tar", e))?
                .to_string_lossy()
                .into_owned();
            members.push(TarMember {
                name,
                offset: entry.raw_file_position(),
                size: entry.size(),
                cksum: header.cksum().map_err(|e| ModelError::malformed("tar", e))?,
                mtime: header.mtime().unwrap_or(0),
            });
        }

        Ok(Arc::new(TarCookie {
            local,
            members: Arc::new(members),
        }))
    }

    fn handles(&self, this: &Arc<Source>, cookie: Cookie) -> Result<HandleIter> {
        let cookie = cookie
            .downcast::<TarCookie>()
            .map_err(|_| ModelError::CookieType("tar"))?;
        let members = Arc::clone(&cookie.members);
        let source = Arc::clone(this);

        let iter = (0..members.len())
            .map(move |i| Ok(Handle::new(Arc::clone(&source), members[i].name.clone())));
        Ok(Box::new(iter))
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool> {
        match res.cookie::<TarCookie>() {
            Ok(cookie) => Ok(cookie.member(res.handle().relative_path()).is_some()),
            Err(err) if parent_missing(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream> {
        let cookie = res.cookie::<TarCookie>()?;
        let member = cookie
            .member(res.handle().relative_path())
            .ok_or_else(|| ModelError::not_found(res.handle()))?;

        let mut file = File::open(cookie.local.path())?;
        file.seek(SeekFrom::Start(member.offset))?;
        let threshold = res.manager().settings().spool_threshold.as_usize();
        Ok(ContentStream::spool(&mut file.take(member.size), threshold)?)
    }

    fn last_modified(&self, res: &Resource<'_>) -> Result<Option<DateTime<Utc>>> {
        let cookie = res.cookie::<TarCookie>()?;
        let mtime = cookie
            .member(res.handle().relative_path())
            .map(|m| m.mtime)
            .unwrap_or(0);
        match i64::try_from(mtime).ok().and_then(|t| DateTime::from_timestamp(t, 0)) {
            Some(ts) if mtime > 0 => Ok(Some(ts)),
            _ => self.handle.follow(res.manager()).last_modified(),
        }
    }

    fn hash(&self, res: &Resource<'_>) -> Result<Option<String>> {
        let cookie = res.cookie::<TarCookie>()?;
        Ok(cookie
            .member(res.handle().relative_path())
            .map(|m| format!("{:08x}", m.cksum)))
    }

    fn size(&self, res: &Resource<'_>) -> Result<Option<u64>> {
        let cookie = res.cookie::<TarCookie>()?;
        Ok(cookie.member(res.handle().relative_path()).map(|m| m.size))
    }
}
