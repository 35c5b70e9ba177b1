//! Sources that reinterpret the content of another handle as a container.

mod mail;
mod pdf;
mod tar;
mod zip;

pub use self::mail::MailSource;
pub use self::pdf::{PdfPageSource, PdfSource};
pub use self::tar::TarSource;
pub use self::zip::ZipSource;

use super::error::{ModelError, Result};
use std::sync::{Mutex, MutexGuard};

fn lock<'a, T>(mutex: &'a Mutex<T>, kind: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| ModelError::malformed(kind, "session state poisoned by an earlier panic"))
}

/// A derived object whose container has itself vanished is reported as
/// gone rather than as a failure.
fn parent_missing(err: &ModelError) -> bool {
    err.is_missing()
}
