use super::{QueueNames, Stage, problem};
use crate::conversions::ConversionRegistry;
use crate::model::{ModelSettings, SourceManager};
use crate::pipeline::messages::{ConversionMessage, MatchesMessage, Outgoing};
use crate::rules::MatchError;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Converts each object named by a conversion request and evaluates the
/// scan's rule on it.
///
/// One [`SourceManager`] lives as long as the stage, so consecutive objects
/// from the same container reuse its open session.
pub struct ProcessorStage {
    queues: QueueNames,
    registry: Arc<ConversionRegistry>,
    sm: SourceManager,
}

impl ProcessorStage {
    pub fn new(queues: QueueNames, registry: Arc<ConversionRegistry>, settings: ModelSettings) -> Self {
        Self {
            queues,
            registry,
            sm: SourceManager::new(ModelSettings {
                skip_images: false,
                ..settings
            }),
        }
    }

    pub fn manager(&self) -> &SourceManager {
        &self.sm
    }

    fn process(&self, message: &ConversionMessage) -> serde_json::Result<Outgoing> {
        let spec = &message.scan_spec;
        let handle = &message.handle;
        let report = |text: String, missing: bool| {
            problem(
                &self.queues.problems,
                &spec.scan_tag,
                None,
                Some(handle),
                text,
                missing,
            )
        };

        let matcher = match spec.rule.compile() {
            Ok(matcher) => matcher,
            Err(err) => return report(err.to_string(), false),
        };

        let resource = handle.follow(&self.sm);
        match resource.check() {
            Ok(true) => {}
            Ok(false) => return report(format!("{handle} no longer exists"), true),
            Err(err) => return report(err.to_string(), err.is_missing()),
        }

        let outcome = match matcher.match_resource(&resource, &self.registry) {
            Ok(outcome) => outcome,
            Err(err) => {
                let missing = matches!(&err, MatchError::Conversion(e) if e.is_missing());
                warn!(handle = %handle, error = %err, "Matching failed");
                return report(err.to_string(), missing);
            }
        };
        let metadata = resource.metadata().unwrap_or_else(|err| {
            debug!(handle = %handle, error = %err, "No metadata");
            Default::default()
        });

        debug!(handle = %handle, matched = outcome.matched, no_data = outcome.no_data, "Processed");
        Outgoing::new(
            &self.queues.matches,
            &MatchesMessage {
                scan_spec: spec.censor(),
                handle: handle.censor(),
                matched: outcome.matched,
                no_data: outcome.no_data,
                matches: outcome.matches,
                metadata,
            },
        )
    }
}

impl Stage for ProcessorStage {
    fn name(&self) -> &'static str {
        "processor"
    }

    fn read_queues(&self) -> Vec<String> {
        vec![self.queues.conversions.clone()]
    }

    fn write_queues(&self) -> Vec<String> {
        vec![self.queues.matches.clone(), self.queues.problems.clone()]
    }

    fn problem_queue(&self) -> &str {
        &self.queues.problems
    }

    fn handle_message(
        &mut self,
        body: &Value,
        queue: &str,
        emit: &mut dyn FnMut(Outgoing),
    ) -> serde_json::Result<()> {
        let message: ConversionMessage = match serde_json::from_value(body.clone()) {
            Ok(message) => message,
            Err(err) => {
                warn!(queue, error = %err, "Dropping undecodable conversion request");
                return Ok(());
            }
        };
        emit(self.process(&message)?);
        Ok(())
    }
}
