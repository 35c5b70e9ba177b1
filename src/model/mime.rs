//! Content type guessing from names and leading bytes.

/// Type of the synthetic handles that stand for single pages of a PDF.
pub const PAGE_TYPE: &str = "application/x.nestscan.pdf-page";

pub const OCTET_STREAM: &str = "application/octet-stream";

const BY_EXTENSION: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("text", "text/plain"),
    ("log", "text/plain"),
    ("md", "text/plain"),
    ("csv", "text/csv"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("xml", "text/xml"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("tar", "application/x-tar"),
    ("eml", "message/rfc822"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
];

/// Guesses a MIME type from the extension of `name`, falling back to
/// `application/octet-stream`.
pub fn guess_from_name(name: &str) -> String {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    BY_EXTENSION
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, ty)| ty.to_string())
        .unwrap_or_else(|| ::mime::APPLICATION_OCTET_STREAM.essence_str().to_string())
}

/// Recognises the container formats the model can descend into by their
/// magic numbers.
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"PK\x03\x04") {
        Some("application/zip")
    } else if head.starts_with(b"%PDF") {
        Some("application/pdf")
    } else if head.len() >= 262 && &head[257..262] == b"ustar" {
        Some("application/x-tar")
    } else {
        None
    }
}

/// Extension (without dot) conventionally used for a MIME type, for naming
/// temporary files handed to external tools.
pub fn extension_for(mime: &str) -> Option<&'static str> {
    BY_EXTENSION
        .iter()
        .find(|(_, ty)| *ty == mime)
        .map(|(ext, _)| *ext)
}

/// Strips parameters such as `; charset=utf-8` and lowercases the rest.
pub fn essence(mime: &str) -> String {
    mime.parse::<::mime::Mime>()
        .map(|m| m.essence_str().to_ascii_lowercase())
        .unwrap_or_else(|_| {
            mime.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
}
