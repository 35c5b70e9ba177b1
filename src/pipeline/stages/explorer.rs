use super::{QueueNames, Stage, problem};
use crate::model::{DerivedSourceTable, Handle, ModelSettings, SourceManager, Visit, Walker};
use crate::pipeline::messages::{ConversionMessage, HandlesMessage, Outgoing, ScanSpecMessage};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Explores the source of each scan specification, emitting one conversion
/// request per object found.
pub struct ExplorerStage {
    queues: QueueNames,
    table: Arc<DerivedSourceTable>,
    settings: ModelSettings,
    default_max_depth: usize,
}

impl ExplorerStage {
    pub fn new(
        queues: QueueNames,
        table: Arc<DerivedSourceTable>,
        settings: ModelSettings,
        default_max_depth: usize,
    ) -> Self {
        Self {
            queues,
            table,
            settings,
            default_max_depth,
        }
    }

    /// Worker settings with the scan's own overrides applied.
    fn scan_settings(&self, spec: &ScanSpecMessage) -> ModelSettings {
        ModelSettings {
            skip_images: spec
                .configuration
                .skip_images
                .unwrap_or(self.settings.skip_images),
            ..self.settings.clone()
        }
    }

    fn explore(&self, spec: &ScanSpecMessage, emit: &mut dyn FnMut(Outgoing)) -> serde_json::Result<()> {
        let sm = SourceManager::new(self.scan_settings(spec));
        let max_depth = spec.configuration.max_depth.unwrap_or(self.default_max_depth);
        let walker = Walker::new(self.table.clone(), max_depth);
        let source = Arc::new(spec.source.clone());

        let mut handles = Vec::new();
        let mut conversions = 0usize;
        let mut failure = None;
        let walked = walker.walk(&source, &sm, &mut |visit| {
            if failure.is_some() {
                return;
            }
            match self.visit_message(spec, visit, &mut handles) {
                Ok(Some(message)) => {
                    if message.queue == self.queues.conversions {
                        conversions += 1;
                    }
                    emit(message);
                }
                Ok(None) => {}
                Err(err) => failure = Some(err),
            }
        });
        sm.close_all();

        if let Err(err) = walked {
            warn!(scan_id = %spec.scan_tag.scan_id, error = %err, "Source could not be explored");
            emit(problem(
                &self.queues.problems,
                &spec.scan_tag,
                Some(&spec.source),
                None,
                err.to_string(),
                err.is_missing(),
            )?);
            return Ok(());
        }
        if let Some(err) = failure {
            return Err(err);
        }

        info!(
            scan_id = %spec.scan_tag.scan_id,
            handles = handles.len(),
            conversions,
            "Exploration finished"
        );
        emit(Outgoing::new(
            &self.queues.handles,
            &HandlesMessage {
                scan_tag: spec.scan_tag.clone(),
                source: spec.source.censor(),
                handles,
                complete: true,
            },
        )?);
        Ok(())
    }

    /// The message a single visit produces, if any. Every handle is also
    /// recorded for the closing [`HandlesMessage`].
    fn visit_message(
        &self,
        spec: &ScanSpecMessage,
        visit: Visit,
        handles: &mut Vec<Handle>,
    ) -> serde_json::Result<Option<Outgoing>> {
        match visit {
            Visit::Problem(handle, err) => problem(
                &self.queues.problems,
                &spec.scan_tag,
                Some(&spec.source),
                handle.as_ref(),
                err.to_string(),
                err.is_missing(),
            )
            .map(Some),
            Visit::Container(handle) => {
                handles.push(handle.censor());
                Ok(None)
            }
            Visit::Leaf(handle) | Visit::Degraded(handle, _) | Visit::TooDeep(handle) => {
                handles.push(handle.censor());
                Outgoing::new(
                    &self.queues.conversions,
                    &ConversionMessage {
                        scan_spec: spec.clone(),
                        handle,
                    },
                )
                .map(Some)
            }
        }
    }
}

impl Stage for ExplorerStage {
    fn name(&self) -> &'static str {
        "explorer"
    }

    fn read_queues(&self) -> Vec<String> {
        vec![self.queues.scan_specs.clone()]
    }

    fn write_queues(&self) -> Vec<String> {
        vec![
            self.queues.conversions.clone(),
            self.queues.handles.clone(),
            self.queues.problems.clone(),
        ]
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
        let spec: ScanSpecMessage = match serde_json::from_value(body.clone()) {
            Ok(spec) => spec,
            Err(err) => {
                warn!(queue, error = %err, "Dropping undecodable scan specification");
                return Ok(());
            }
        };
        debug!(scan_id = %spec.scan_tag.scan_id, source = spec.source.type_label(), "Exploring");
        self.explore(&spec, emit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSource, FilesystemSource, Source};
    use crate::pipeline::messages::{ProblemMessage, ScanConfiguration, ScanTag};
    use crate::rules::RuleSpec;
    use std::fs;
    use tempfile::TempDir;

    fn stage() -> ExplorerStage {
        ExplorerStage::new(
            QueueNames::default(),
            Arc::new(DerivedSourceTable::with_defaults()),
            ModelSettings::default(),
            8,
        )
    }

    fn spec(source: Source) -> ScanSpecMessage {
        ScanSpecMessage {
            scan_tag: ScanTag::new("test"),
            source,
            rule: RuleSpec::Always,
            configuration: ScanConfiguration::default(),
        }
    }

    fn run(stage: &mut ExplorerStage, body: &Value) -> Vec<Outgoing> {
        let mut out = Vec::new();
        stage
            .handle_message(body, "q", &mut |message| out.push(message))
            .unwrap();
        out
    }

    fn explore(source: Source) -> Vec<Outgoing> {
        run(&mut stage(), &serde_json::to_value(spec(source)).unwrap())
    }

    #[test]
    fn test_directory_yields_conversion_per_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("sub/b.txt"), "b").unwrap();

        let queues = QueueNames::default();
        let out = explore(Source::File(FilesystemSource::new(temp_dir.path())));

        let conversions: Vec<ConversionMessage> = out
            .iter()
            .filter(|m| m.queue == queues.conversions)
            .map(|m| serde_json::from_value(m.body.clone()).unwrap())
            .collect();
        let paths: Vec<&str> = conversions.iter().map(|c| c.handle.relative_path()).collect();
        assert_eq!(paths, vec!["a.txt", "sub/b.txt"]);

        let last = out.last().unwrap();
        assert_eq!(last.queue, queues.handles);
        let handles: HandlesMessage = serde_json::from_value(last.body.clone()).unwrap();
        assert!(handles.complete);
        assert_eq!(handles.handles.len(), 2);
    }

    #[test]
    fn test_missing_root_is_reported_as_problem() {
        let temp_dir = TempDir::new().unwrap();
        let out = explore(Source::File(FilesystemSource::new(temp_dir.path().join("gone"))));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].queue, QueueNames::default().problems);
        let problem: ProblemMessage = serde_json::from_value(out[0].body.clone()).unwrap();
        assert!(problem.handle.is_none());
        assert!(problem.source.is_some());
    }

    #[test]
    fn test_inline_content_is_not_echoed_in_handles() {
        let out = explore(Source::Data(DataSource::new(b"secret".to_vec(), "text/plain", None)));
        let handles: HandlesMessage = serde_json::from_value(out.last().unwrap().body.clone()).unwrap();
        let Source::Data(data) = &handles.source else {
            panic!("expected data source");
        };
        assert!(data.content.is_empty());
    }

    #[test]
    fn test_undecodable_body_is_dropped() {
        let out = run(&mut stage(), &serde_json::json!({"nonsense": true}));
        assert!(out.is_empty());
    }

    #[test]
    fn test_skip_images_falls_back_to_worker_setting() {
        let stage = ExplorerStage::new(
            QueueNames::default(),
            Arc::new(DerivedSourceTable::with_defaults()),
            ModelSettings::builder().skip_images(true).build(),
            8,
        );
        let mut scan = spec(Source::Data(DataSource::new(b"x".to_vec(), "text/plain", None)));
        assert!(stage.scan_settings(&scan).skip_images);

        scan.configuration.skip_images = Some(false);
        assert!(!stage.scan_settings(&scan).skip_images);
    }

    #[test]
    fn test_messages_are_emitted_while_walking() {
        let temp_dir = TempDir::new().unwrap();
        for dir in ["a", "b"] {
            fs::create_dir(temp_dir.path().join(dir)).unwrap();
            fs::write(temp_dir.path().join(dir).join("1.txt"), dir).unwrap();
        }
        let late = temp_dir.path().join("b/2.txt");
        let body = serde_json::to_value(spec(Source::File(FilesystemSource::new(temp_dir.path())))).unwrap();

        // "b" is only listed after everything in "a" has been emitted, so a
        // file created from the sink is still found.
        let mut seen = Vec::new();
        stage()
            .handle_message(&body, "q", &mut |message| {
                if let Ok(conversion) = serde_json::from_value::<ConversionMessage>(message.body) {
                    if seen.is_empty() {
                        fs::write(&late, "late").unwrap();
                    }
                    seen.push(conversion.handle.relative_path().to_string());
                }
            })
            .unwrap();
        assert_eq!(seen, vec!["a/1.txt", "b/1.txt", "b/2.txt"]);
    }
}
