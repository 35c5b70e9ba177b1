//! Inline content carried inside the source description itself.

use super::error::{ModelError, Result};
use super::handle::Handle;
use super::manager::{Cookie, SourceManager};
use super::resource::{ContentStream, Resource};
use super::source::{HandleIter, Source, SourceDriver, sha256_hex};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

const DATA_PATH: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub content: Vec<u8>,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DataSource {
    pub fn new(content: Vec<u8>, mime: impl Into<String>, name: Option<String>) -> Self {
        Self {
            content,
            mime: mime.into(),
            name,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("inline data")
    }

    pub(crate) fn censor(&self) -> DataSource {
        DataSource {
            content: Vec::new(),
            mime: self.mime.clone(),
            name: self.name.clone(),
        }
    }
}

impl SourceDriver for DataSource {
    fn open(&self, _sm: &SourceManager) -> Result<Cookie> {
        Ok(Arc::new(Bytes::copy_from_slice(&self.content)))
    }

    fn handles(&self, this: &Arc<Source>, _cookie: Cookie) -> Result<HandleIter> {
        let handle = Handle::new(Arc::clone(this), DATA_PATH);
        Ok(Box::new(std::iter::once(Ok(handle))))
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool> {
        Ok(res.handle().relative_path() == DATA_PATH)
    }

    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream> {
        if res.handle().relative_path() != DATA_PATH {
            return Err(ModelError::not_found(res.handle().relative_path()));
        }
        let bytes = res.cookie::<Bytes>()?;
        Ok(ContentStream::from_bytes(Bytes::clone(&bytes)))
    }

    fn hash(&self, _res: &Resource<'_>) -> Result<Option<String>> {
        Ok(Some(sha256_hex(&mut self.content.as_slice())?))
    }

    fn size(&self, _res: &Resource<'_>) -> Result<Option<u64>> {
        Ok(Some(self.content.len() as u64))
    }
}

fn to_base64<S: Serializer>(content: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(content))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}
