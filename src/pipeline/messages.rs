//! JSON message bodies exchanged between pipeline stages.

use crate::model::{Handle, Source};
use crate::rules::{Fragment, RuleSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifies one scan across every message it causes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTag {
    pub scan_id: Uuid,
    pub scanner: String,
    pub time: DateTime<Utc>,
}

impl ScanTag {
    pub fn new(scanner: impl Into<String>) -> Self {
        Self {
            scan_id: Uuid::now_v7(),
            scanner: scanner.into(),
            time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfiguration {
    /// Overrides the worker's `model.skip_images` for this scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_images: Option<bool>,
    /// Overrides the worker's derived-source depth limit for this scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
}

/// A request to explore a source and evaluate a rule on everything in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpecMessage {
    pub scan_tag: ScanTag,
    pub source: Source,
    pub rule: RuleSpec,
    #[serde(default)]
    pub configuration: ScanConfiguration,
}

impl ScanSpecMessage {
    /// Copy without inline content, for messages leaving the scanner.
    pub fn censor(&self) -> Self {
        Self {
            source: self.source.censor(),
            ..self.clone()
        }
    }
}

/// One object found by exploration, to be converted and matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionMessage {
    pub scan_spec: ScanSpecMessage,
    pub handle: Handle,
}

/// The objects found below a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlesMessage {
    pub scan_tag: ScanTag,
    pub source: Source,
    pub handles: Vec<Handle>,
    /// No further handles follow for this source.
    pub complete: bool,
}

/// The outcome of evaluating a scan's rule on one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchesMessage {
    pub scan_spec: ScanSpecMessage,
    pub handle: Handle,
    pub matched: bool,
    pub no_data: bool,
    pub matches: Vec<Fragment>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Something went wrong with a source or an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemMessage {
    pub scan_tag: ScanTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
    pub message: String,
    /// The object is gone for good; records about it can be cleared.
    pub missing: bool,
}

/// A message produced by a stage, addressed to a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outgoing {
    pub queue: String,
    pub body: Value,
}

impl Outgoing {
    pub fn new<T: Serialize>(queue: impl Into<String>, message: &T) -> serde_json::Result<Self> {
        Ok(Self {
            queue: queue.into(),
            body: serde_json::to_value(message)?,
        })
    }
}
