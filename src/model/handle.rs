use super::manager::SourceManager;
use super::mime::{self as types, PAGE_TYPE};
use super::resource::Resource;
use super::source::Source;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Immutable reference to one object inside a [`Source`].
///
/// Equality and hashing consider only the source and the relative path; the
/// type hint is advisory and presentation strings are always recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "HandleWire", try_from = "HandleWire")]
pub struct Handle {
    source: Arc<Source>,
    relative_path: String,
    hint: Option<String>,
}

impl Handle {
    pub fn new(source: Arc<Source>, relative_path: impl Into<String>) -> Self {
        Self {
            source,
            relative_path: relative_path.into(),
            hint: None,
        }
    }

    /// Attaches a MIME type known from the container (e.g. a mail part's
    /// `Content-Type`), preferred over guessing from the name.
    pub fn with_hint(mut self, mime: impl Into<String>) -> Self {
        self.hint = Some(mime.into());
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn source_arc(&self) -> &Arc<Source> {
        &self.source
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn type_label(&self) -> &'static str {
        self.source.handle_label()
    }

    /// Binds this handle to a live session held by `sm`.
    pub fn follow<'a>(&self, sm: &'a SourceManager) -> Resource<'a> {
        Resource::new(self.clone(), sm)
    }

    /// Last path component, or a synthetic name for handles without one.
    pub fn name(&self) -> String {
        match &*self.source {
            Source::Data(data) => data.display_name().to_string(),
            Source::Pdf(_) => format!("page {}", self.relative_path),
            _ => self
                .relative_path
                .rsplit('/')
                .next()
                .unwrap_or(&self.relative_path)
                .to_string(),
        }
    }

    /// Extension of [`Handle::name`], used to name temporary copies.
    pub fn extension(&self) -> Option<String> {
        let name = self.name();
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.contains(' ') => Some(ext.to_string()),
            _ => self
                .guess_type()
                .as_deref()
                .and_then(types::extension_for)
                .map(str::to_string),
        }
    }

    /// Short label for the object within its container.
    pub fn presentation_name(&self) -> String {
        match &*self.source {
            Source::Data(data) => data.display_name().to_string(),
            Source::Pdf(_) => format!("page {}", self.relative_path),
            Source::Mail(mail) => {
                let mail_name = mail.handle.name();
                match self.attachment_name() {
                    Some(file) => format!("{mail_name} (attachment {file})"),
                    None => mail_name,
                }
            }
            _ => self.relative_path.clone(),
        }
    }

    /// Where the object lives, without naming the object itself.
    pub fn presentation_place(&self) -> String {
        match &*self.source {
            Source::File(fs) => fs.path.display().to_string(),
            Source::Data(_) => "inline data".to_string(),
            _ => self
                .source
                .parent()
                .map(|parent| parent.to_string())
                .unwrap_or_default(),
        }
    }

    /// Key that keeps objects from the same outermost file together.
    pub fn sort_key(&self) -> String {
        match &*self.source {
            Source::File(fs) => fs.path.join(&self.relative_path).display().to_string(),
            Source::Data(data) => data.display_name().to_string(),
            _ => self.base_handle().sort_key(),
        }
    }

    /// The outermost handle, i.e. the one that belongs to a root source.
    pub fn base_handle(&self) -> Handle {
        match self.source.parent() {
            Some(parent) => parent.base_handle(),
            None => self.clone(),
        }
    }

    /// Best guess at the content type that needs no I/O.
    pub fn guess_type(&self) -> Option<String> {
        if let Some(hint) = &self.hint {
            return Some(types::essence(hint));
        }
        match &*self.source {
            Source::Data(data) => Some(types::essence(&data.mime)),
            Source::Pdf(_) => Some(PAGE_TYPE.to_string()),
            _ => Some(types::guess_from_name(&self.name())),
        }
    }

    /// A copy that carries no inline content, suitable for results.
    pub fn censor(&self) -> Handle {
        Handle {
            source: Arc::new(self.source.censor()),
            relative_path: self.relative_path.clone(),
            hint: self.hint.clone(),
        }
    }

    fn attachment_name(&self) -> Option<&str> {
        let (_, file) = self.relative_path.rsplit_once('/')?;
        (file != "body").then_some(file)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.relative_path == other.relative_path && self.source == other.source
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.relative_path.hash(state);
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.source {
            Source::File(fs) => write!(f, "{}", fs.path.join(&self.relative_path).display()),
            Source::Data(data) => f.write_str(data.display_name()),
            Source::Zip(zip) => write!(
                f,
                "file {} of {}",
                self.relative_path,
                zip.handle.presentation_name()
            ),
            Source::Tar(tar) => write!(
                f,
                "file {} of {}",
                self.relative_path,
                tar.handle.presentation_name()
            ),
            Source::Pdf(pdf) => write!(
                f,
                "page {} of {} ({})",
                self.relative_path,
                pdf.handle.name(),
                pdf.handle
            ),
            Source::PdfPage(page) => {
                let kind = match self.guess_type().as_deref() {
                    Some(t) if t.starts_with("text/") => "text",
                    Some(t) if t.starts_with("image/") => "image",
                    _ => "unknown object",
                };
                write!(f, "{kind} on {}", page.handle)
            }
            Source::Mail(mail) => match self.attachment_name() {
                Some(file) => write!(f, "attachment {file} of {}", mail.handle),
                None => write!(f, "body of {}", mail.handle),
            },
        }
    }
}

/// Serialized form of a [`Handle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandleWire {
    #[serde(rename = "type")]
    type_label: String,
    source: Arc<Source>,
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime: Option<String>,
    /// Written for human readers of the message; never trusted on input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    presentation: Option<String>,
}

impl From<Handle> for HandleWire {
    fn from(handle: Handle) -> Self {
        let presentation = handle.to_string();
        HandleWire {
            type_label: handle.type_label().to_string(),
            source: handle.source,
            path: handle.relative_path,
            mime: handle.hint,
            presentation: Some(presentation),
        }
    }
}

impl TryFrom<HandleWire> for Handle {
    type Error = String;

    fn try_from(wire: HandleWire) -> Result<Self, Self::Error> {
        let expected = wire.source.handle_label();
        if wire.type_label != expected {
            return Err(format!(
                "handle type '{}' does not match its source, expected '{expected}'",
                wire.type_label
            ));
        }
        Ok(Handle {
            source: wire.source,
            relative_path: wire.path,
            hint: wire.mime,
        })
    }
}
