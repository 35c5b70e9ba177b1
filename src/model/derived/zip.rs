use super::{lock, parent_missing};
use crate::model::error::{ModelError, Result};
use crate::model::handle::Handle;
use crate::model::manager::{Cookie, SourceManager};
use crate::model::resource::{ContentStream, LocalPath, Resource};
use crate::model::source::{HandleIter, Source, SourceDriver};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::sync::{Arc, Mutex};
use tracing::warn;
use ::zip::ZipArchive;

/// Members of a ZIP archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZipSource {
    pub handle: Handle,
}

impl ZipSource {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

#[derive(Debug, Clone)]
struct ZipMember {
    index: usize,
    name: String,
    crc32: u32,
    size: u64,
    encrypted: bool,
}

struct ZipCookie {
    archive: Mutex<ZipArchive<File>>,
    members: Arc<Vec<ZipMember>>,
    // Keeps a materialized copy of the archive alive with the session.
    _local: LocalPath,
}

impl ZipCookie {
    fn member(&self, name: &str) -> Option<&ZipMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

impl SourceDriver for ZipSource {
    fn open(&self, sm: &SourceManager) -> Result<Cookie> {
        let local = self.handle.follow(sm).make_path()?;
        let file = File::open(local.path())?;
        let mut archive = ZipArchive::new(file).map_err(|e| ModelError::malformed("zip", e))?;

        let mut members = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            if entry.is_dir() {
                continue;
            }
            members.push(ZipMember {
                index,
                name: entry.name().to_string(),
                crc32: entry.crc32(),
                size: entry.size(),
                encrypted: entry.encrypted(),
            });
        }

        Ok(Arc::new(ZipCookie {
            archive: Mutex::new(archive),
            members: Arc::new(members),
            _local: local,
        }))
    }

    fn handles(&self, this: &Arc<Source>, cookie: Cookie) -> Result<HandleIter> {
        let cookie = cookie
            .downcast::<ZipCookie>()
            .map_err(|_| ModelError::CookieType("zip"))?;
        let members = Arc::clone(&cookie.members);
        let source = Arc::clone(this);
        let container = self.handle.to_string();

        let iter = (0..members.len()).filter_map(move |i| {
            let member = &members[i];
            if member.encrypted {
                warn!(member = %member.name, container = %container, "Skipping encrypted zip member");
                return None;
            }
            Some(Ok(Handle::new(Arc::clone(&source), member.name.clone())))
        });
        Ok(Box::new(iter))
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool> {
        match res.cookie::<ZipCookie>() {
            Ok(cookie) => Ok(cookie.member(res.handle().relative_path()).is_some()),
            Err(err) if parent_missing(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream> {
        let cookie = res.cookie::<ZipCookie>()?;
        let name = res.handle().relative_path();
        let member = cookie
            .member(name)
            .ok_or_else(|| ModelError::not_found(res.handle()))?;
        if member.encrypted {
            return Err(ModelError::Encrypted(res.handle().to_string()));
        }

        let mut archive = lock(&cookie.archive, "zip")?;
        let mut entry = archive.by_index(member.index)?;
        let threshold = res.manager().settings().spool_threshold.as_usize();
        Ok(ContentStream::spool(&mut entry, threshold)?)
    }

    fn hash(&self, res: &Resource<'_>) -> Result<Option<String>> {
        let cookie = res.cookie::<ZipCookie>()?;
        Ok(cookie
            .member(res.handle().relative_path())
            .map(|m| format!("{:08x}", m.crc32)))
    }

    fn size(&self, res: &Resource<'_>) -> Result<Option<u64>> {
        let cookie = res.cookie::<ZipCookie>()?;
        Ok(cookie.member(res.handle().relative_path()).map(|m| m.size))
    }
}
