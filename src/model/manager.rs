//! Scoped registry of open source sessions.
//!
//! A [`SourceManager`] maps each open [`Source`] to its cookie and keeps at
//! most `width` of them registered, evicting the least recently used one
//! before a new session is added. Cookies are reference counted: an evicted
//! cookie still in use by an iterator or resource is released when that user
//! drops it, so the manager never invalidates state out from under a caller.

use super::error::{ModelError, Result};
use super::source::Source;
use crate::humanize::ByteSize;
use bon::Builder;
use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Opaque per-source session state.
pub type Cookie = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Builder)]
pub struct ModelSettings {
    /// Maximum number of simultaneously registered cookies.
    #[builder(default = 3)]
    pub width: usize,
    /// Archive members larger than this are spooled to disk.
    #[builder(default = ByteSize::mib(8))]
    pub spool_threshold: ByteSize,
    /// Wall-clock limit for external converter tools.
    #[builder(default = Duration::from_secs(180))]
    pub subprocess_timeout: Duration,
    /// Skip image extraction when splitting PDF pages.
    #[builder(default = false)]
    pub skip_images: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub open: usize,
    pub opened_total: u64,
    pub closed_total: u64,
    pub high_water: usize,
}

struct Entry {
    source: Arc<Source>,
    cookie: Cookie,
}

#[derive(Default)]
struct Inner {
    /// Least recently used first.
    entries: Vec<Entry>,
    stats: ManagerStats,
}

pub struct SourceManager {
    settings: ModelSettings,
    inner: RefCell<Inner>,
}

impl SourceManager {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            settings: ModelSettings {
                width: settings.width.max(1),
                ..settings
            },
            inner: RefCell::new(Inner::default()),
        }
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    /// Returns the cookie for `source`, opening it on first use.
    ///
    /// Opening a derived source opens its ancestors through this same
    /// manager, so no borrow of the registry is held across the driver call.
    /// A failed open leaves nothing registered for `source`.
    pub fn open(&self, source: &Arc<Source>) -> Result<Cookie> {
        if let Some(cookie) = self.touch(source) {
            return Ok(cookie);
        }

        let cookie = source.driver().open(self)?;

        let mut inner = self.inner.borrow_mut();
        if let Some(pos) = inner.entries.iter().position(|e| *e.source == **source) {
            // A nested open registered the same source while we were opening.
            let entry = inner.entries.remove(pos);
            let existing = entry.cookie.clone();
            inner.entries.push(entry);
            return Ok(existing);
        }

        while inner.entries.len() >= self.settings.width {
            let evicted = inner.entries.remove(0);
            inner.stats.closed_total += 1;
            debug!(source = evicted.source.type_label(), "Evicting source session");
            evicted.source.driver().close(evicted.cookie);
        }

        inner.entries.push(Entry {
            source: Arc::clone(source),
            cookie: cookie.clone(),
        });
        inner.stats.opened_total += 1;
        inner.stats.open = inner.entries.len();
        inner.stats.high_water = inner.stats.high_water.max(inner.stats.open);
        debug!(
            source = source.type_label(),
            open = inner.stats.open,
            "Opened source session"
        );

        Ok(cookie)
    }

    /// Like [`SourceManager::open`], downcasting the cookie to the type the
    /// source's driver stores.
    pub fn open_as<T: Any + Send + Sync>(&self, source: &Arc<Source>) -> Result<Arc<T>> {
        self.open(source)?
            .downcast::<T>()
            .map_err(|_| ModelError::CookieType(source.type_label()))
    }

    /// Releases the session for `source`, if one is registered.
    pub fn close(&self, source: &Source) -> bool {
        let entry = {
            let mut inner = self.inner.borrow_mut();
            let Some(pos) = inner.entries.iter().position(|e| *e.source == *source) else {
                return false;
            };
            let entry = inner.entries.remove(pos);
            inner.stats.closed_total += 1;
            inner.stats.open = inner.entries.len();
            entry
        };
        entry.source.driver().close(entry.cookie);
        true
    }

    /// Releases every registered session, most recently used first.
    pub fn close_all(&self) {
        let entries = {
            let mut inner = self.inner.borrow_mut();
            let entries = std::mem::take(&mut inner.entries);
            inner.stats.closed_total += entries.len() as u64;
            inner.stats.open = 0;
            entries
        };
        if !entries.is_empty() {
            debug!(count = entries.len(), "Closing all source sessions");
        }
        for entry in entries.into_iter().rev() {
            entry.source.driver().close(entry.cookie);
        }
    }

    pub fn is_open(&self, source: &Source) -> bool {
        self.inner
            .borrow()
            .entries
            .iter()
            .any(|e| *e.source == *source)
    }

    pub fn stats(&self) -> ManagerStats {
        self.inner.borrow().stats
    }

    fn touch(&self, source: &Source) -> Option<Cookie> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner.entries.iter().position(|e| *e.source == *source)?;
        let entry = inner.entries.remove(pos);
        let cookie = entry.cookie.clone();
        inner.entries.push(entry);
        Some(cookie)
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new(ModelSettings::default())
    }
}

impl Drop for SourceManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
