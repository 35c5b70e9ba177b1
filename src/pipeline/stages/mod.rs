//! Stage logic run by the pipeline runner for each inbound message.

mod explorer;
mod processor;

pub use explorer::ExplorerStage;
pub use processor::ProcessorStage;

use super::messages::{Outgoing, ProblemMessage, ScanTag};
use crate::model::{Handle, Source};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Names of the queues connecting the stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNames {
    #[serde(default = "default_scan_specs")]
    pub scan_specs: String,
    #[serde(default = "default_conversions")]
    pub conversions: String,
    #[serde(default = "default_matches")]
    pub matches: String,
    #[serde(default = "default_problems")]
    pub problems: String,
    #[serde(default = "default_handles")]
    pub handles: String,
}

fn default_scan_specs() -> String {
    "nestscan_scan_specs".to_string()
}

fn default_conversions() -> String {
    "nestscan_conversions".to_string()
}

fn default_matches() -> String {
    "nestscan_matches".to_string()
}

fn default_problems() -> String {
    "nestscan_problems".to_string()
}

fn default_handles() -> String {
    "nestscan_handles".to_string()
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            scan_specs: default_scan_specs(),
            conversions: default_conversions(),
            matches: default_matches(),
            problems: default_problems(),
            handles: default_handles(),
        }
    }
}

impl QueueNames {
    /// All queue names, in declaration order.
    pub fn all(&self) -> [&str; 5] {
        [
            &self.scan_specs,
            &self.conversions,
            &self.matches,
            &self.problems,
            &self.handles,
        ]
    }
}

/// One kind of pipeline worker.
///
/// Stages are synchronous: the runner moves the stage onto the blocking
/// thread pool for each message and takes it back afterwards. Output is
/// handed to `emit` as soon as it is produced; by the time `emit` returns
/// the runner has stored the message and tried to publish it.
pub trait Stage: Send + 'static {
    fn name(&self) -> &'static str;

    fn read_queues(&self) -> Vec<String>;

    fn write_queues(&self) -> Vec<String>;

    /// Queue receiving [`ProblemMessage`]s, counted separately by the runner.
    fn problem_queue(&self) -> &str;

    /// Handles one decoded message body from `queue`, emitting the messages
    /// to publish in order.
    fn handle_message(
        &mut self,
        body: &Value,
        queue: &str,
        emit: &mut dyn FnMut(Outgoing),
    ) -> serde_json::Result<()>;
}

pub(crate) fn problem(
    queue: &str,
    scan_tag: &ScanTag,
    source: Option<&Source>,
    handle: Option<&Handle>,
    message: impl Into<String>,
    missing: bool,
) -> serde_json::Result<Outgoing> {
    Outgoing::new(
        queue,
        &ProblemMessage {
            scan_tag: scan_tag.clone(),
            source: source.map(Source::censor),
            handle: handle.map(Handle::censor),
            message: message.into(),
            missing,
        },
    )
}
