use crate::subprocess::SubprocessError;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Malformed {kind} content: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Encrypted {0} content cannot be explored")]
    Encrypted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Converter failed: {0}")]
    Subprocess(#[from] SubprocessError),

    #[error("Inline content is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Cookie for {0} source has an unexpected type")]
    CookieType(&'static str),

    #[error("Derived source already registered for {0}")]
    DuplicateDerived(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub fn unavailable(what: impl Display) -> Self {
        Self::Unavailable(what.to_string())
    }

    pub fn not_found(what: impl Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn malformed(kind: &'static str, reason: impl Display) -> Self {
        Self::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }

    /// True when the object behind a handle is gone for good, as opposed to
    /// a failure that may go away on retry.
    pub fn is_missing(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Errors that mean "this container cannot be looked into". The walker
    /// reports such a container as a leaf; any other error is a problem.
    pub fn is_unexplorable(&self) -> bool {
        matches!(
            self,
            Self::Malformed { .. } | Self::Encrypted(_) | Self::Zip(_) | Self::Subprocess(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_unreadable_containers_are_unexplorable() {
        assert!(ModelError::malformed("zip", "bad central directory").is_unexplorable());
        assert!(ModelError::Encrypted("a.zip".into()).is_unexplorable());
        assert!(ModelError::Subprocess(SubprocessError::NotInstalled("pdfinfo".into())).is_unexplorable());
    }

    #[test]
    fn test_io_failures_are_not_unexplorable() {
        let denied = ModelError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!denied.is_unexplorable());
        assert!(!denied.is_missing());

        let gone = ModelError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert!(!gone.is_unexplorable());
        assert!(gone.is_missing());
    }
}
