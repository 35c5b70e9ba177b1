//! Converters available out of the box.

use super::registry::{ConversionError, Converter};
use super::types::OutputType;
use crate::model::Resource;
use crate::subprocess;
use regex::Regex;
use serde_json::Value;
use std::ffi::OsStr;
use std::sync::LazyLock;

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("valid regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

pub(super) fn defaults() -> Vec<(OutputType, Option<&'static str>, Converter)> {
    vec![
        entry(OutputType::Text, Some("text/plain"), plain_text),
        entry(OutputType::Text, Some("text/csv"), plain_text),
        entry(OutputType::Text, Some("text/html"), html_text),
        entry(OutputType::Text, Some("image/png"), image_text),
        entry(OutputType::Text, Some("image/jpeg"), image_text),
        entry(OutputType::LastModified, None, last_modified),
        entry(OutputType::AlwaysTrue, None, always_true),
    ]
}

fn entry<F>(
    output_type: OutputType,
    mime: Option<&'static str>,
    converter: F,
) -> (OutputType, Option<&'static str>, Converter)
where
    F: Fn(&Resource<'_>, &str) -> Result<Option<Value>, ConversionError> + Send + Sync + 'static,
{
    (output_type, mime, Box::new(converter))
}

fn read_text(resource: &Resource<'_>) -> Result<String, ConversionError> {
    let bytes = resource.make_stream()?.read_all()?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn plain_text(resource: &Resource<'_>, _mime: &str) -> Result<Option<Value>, ConversionError> {
    Ok(Some(Value::String(read_text(resource)?)))
}

fn html_text(resource: &Resource<'_>, _mime: &str) -> Result<Option<Value>, ConversionError> {
    Ok(Some(Value::String(strip_html(&read_text(resource)?))))
}

pub(crate) fn strip_html(html: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(html, " ");
    let without_tags = TAG.replace_all(&without_code, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    WHITESPACE.replace_all(&decoded, " ").trim().to_string()
}

fn image_text(resource: &Resource<'_>, _mime: &str) -> Result<Option<Value>, ConversionError> {
    let local = resource.make_path()?;
    let timeout = resource.manager().settings().subprocess_timeout;
    let output = subprocess::run(
        "tesseract",
        [local.path().as_os_str(), OsStr::new("stdout")],
        timeout,
    )?;
    local.close()?;

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!text.is_empty()).then_some(Value::String(text)))
}

fn last_modified(resource: &Resource<'_>, _mime: &str) -> Result<Option<Value>, ConversionError> {
    Ok(resource
        .last_modified()?
        .map(|ts| Value::String(ts.to_rfc3339())))
}

fn always_true(_resource: &Resource<'_>, _mime: &str) -> Result<Option<Value>, ConversionError> {
    Ok(Some(Value::Bool(true)))
}
