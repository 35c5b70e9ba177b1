use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A kind of value a converter can extract from a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputType {
    Text,
    LastModified,
    AlwaysTrue,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Text => "text",
            OutputType::LastModified => "last-modified",
            OutputType::AlwaysTrue => "always-true",
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A converted value together with the registry entry that produced it.
///
/// `value: None` means the converter ran and found nothing, which is
/// different from no converter being available at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleResult {
    pub output_type: OutputType,
    /// The MIME key of the converter used; `None` for the wildcard entry.
    pub mime: Option<String>,
    pub value: Option<Value>,
}

impl SingleResult {
    pub fn as_text(&self) -> Option<&str> {
        self.value.as_ref().and_then(Value::as_str)
    }
}
