//! Runner behaviour over the in-memory broker, including connection loss.

use nestscan::conversions::ConversionRegistry;
use nestscan::model::{
    DataSource, DerivedSourceTable, FilesystemSource, Handle, ModelSettings, Source,
};
use nestscan::pipeline::{
    ConversionMessage, ExplorerStage, FjallOutbox, HandlesMessage, MatchesMessage, MemoryBroker, MemoryOutbox,
    Outbox, Outgoing, PipelineRunner, ProblemMessage, ProcessorStage, QueueNames, RunnerError,
    RunnerSettings, ScanConfiguration, ScanSpecMessage, ScanTag, Stage, TransportError,
};
use nestscan::rules::RuleSpec;
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn settings() -> RunnerSettings {
    RunnerSettings {
        reconnect_delay: Duration::from_millis(1),
    }
}

/// Emits three numbered messages per input.
struct Fanout;

impl Stage for Fanout {
    fn name(&self) -> &'static str {
        "fanout"
    }

    fn read_queues(&self) -> Vec<String> {
        vec!["in".to_string()]
    }

    fn write_queues(&self) -> Vec<String> {
        vec!["out".to_string()]
    }

    fn problem_queue(&self) -> &str {
        "problems"
    }

    fn handle_message(
        &mut self,
        body: &Value,
        _queue: &str,
        emit: &mut dyn FnMut(Outgoing),
    ) -> serde_json::Result<()> {
        if body.get("reject").is_some() {
            return Err(serde::de::Error::custom("rejected"));
        }
        for i in 0..3 {
            emit(Outgoing {
                queue: "out".to_string(),
                body: json!({ "input": body["id"], "part": i }),
            });
            if body.get("crash_after").and_then(Value::as_u64) == Some(i) {
                panic!("worker died mid-message");
            }
        }
        Ok(())
    }
}

/// Records how much of its own output the broker holds each time it emits.
struct Watcher {
    broker: MemoryBroker,
    seen: Vec<usize>,
}

impl Stage for Watcher {
    fn name(&self) -> &'static str {
        "watcher"
    }

    fn read_queues(&self) -> Vec<String> {
        vec!["in".to_string()]
    }

    fn write_queues(&self) -> Vec<String> {
        vec!["out".to_string()]
    }

    fn problem_queue(&self) -> &str {
        "problems"
    }

    fn handle_message(
        &mut self,
        _body: &Value,
        _queue: &str,
        emit: &mut dyn FnMut(Outgoing),
    ) -> serde_json::Result<()> {
        for i in 0..3 {
            emit(Outgoing {
                queue: "out".to_string(),
                body: json!({ "input": 0, "part": i }),
            });
            self.seen.push(self.broker.depth("out"));
        }
        Ok(())
    }
}

fn outputs(broker: &MemoryBroker) -> Vec<(u64, u64)> {
    broker
        .drain("out")
        .iter()
        .map(|b| {
            let v: Value = serde_json::from_slice(b).unwrap();
            (v["input"].as_u64().unwrap(), v["part"].as_u64().unwrap())
        })
        .collect()
}

#[tokio::test]
async fn test_drop_before_publish_delivers_each_message_once() {
    let broker = MemoryBroker::new();
    broker.inject("in", json!({ "id": 1 }).to_string());
    broker.inject("in", json!({ "id": 2 }).to_string());
    // Second output of the first input hits a dead connection.
    broker.drop_before_publish(2);

    let mut runner = PipelineRunner::new(
        Arc::new(broker.connector()),
        Fanout,
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    runner.run(std::future::pending()).await.unwrap();

    assert_eq!(
        outputs(&broker),
        vec![(1, 0), (1, 1), (1, 2), (2, 0), (2, 1), (2, 2)]
    );
    let metrics = runner.metrics().snapshot();
    assert_eq!(metrics.reconnects, 1);
    assert_eq!(metrics.publish_failures, 1);
    assert_eq!(metrics.received, 2);
    assert_eq!(runner.pending(), 0);
    assert_eq!(broker.connections(), 2);
}

#[tokio::test]
async fn test_lost_confirmation_duplicates_one_message() {
    let broker = MemoryBroker::new();
    broker.inject("in", json!({ "id": 7 }).to_string());
    broker.drop_after_publish(1);

    let mut runner = PipelineRunner::new(
        Arc::new(broker.connector()),
        Fanout,
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    runner.run(std::future::pending()).await.unwrap();

    // The broker stored the first message but its confirmation never
    // arrived, so it is sent again after reconnecting.
    assert_eq!(outputs(&broker), vec![(7, 0), (7, 0), (7, 1), (7, 2)]);
}

#[tokio::test]
async fn test_refused_credentials_end_the_runner() {
    let broker = MemoryBroker::new();
    broker.refuse_credentials(true);

    let mut runner = PipelineRunner::new(
        Arc::new(broker.connector()),
        Fanout,
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    let err = runner.run(std::future::pending()).await.unwrap_err();
    assert!(matches!(err, RunnerError::Transport(TransportError::Fatal(_))));
    assert_eq!(runner.metrics().snapshot().reconnects, 0);
}

#[tokio::test]
async fn test_durable_outbox_survives_restart() {
    let outbox_dir = TempDir::new().unwrap();
    let broker = MemoryBroker::new();
    broker.inject("in", json!({ "id": 3 }).to_string());

    // Output left behind by a worker that stopped before publishing it.
    {
        let mut outbox = FjallOutbox::open(outbox_dir.path()).unwrap();
        for part in 0..2 {
            outbox
                .push(Outgoing {
                    queue: "out".to_string(),
                    body: json!({ "input": 3, "part": part }),
                })
                .unwrap();
        }
    }

    let mut runner = PipelineRunner::new(
        Arc::new(broker.connector()),
        Fanout,
        Box::new(FjallOutbox::open(outbox_dir.path()).unwrap()),
        settings(),
    );
    runner.run(std::future::pending()).await.unwrap();

    assert_eq!(
        outputs(&broker),
        vec![(3, 0), (3, 1), (3, 0), (3, 1), (3, 2)]
    );
    assert_eq!(runner.pending(), 0);
    drop(runner);
    assert_eq!(FjallOutbox::open(outbox_dir.path()).unwrap().len(), 0);
}

#[tokio::test]
async fn test_each_message_is_published_before_the_stage_continues() {
    let broker = MemoryBroker::new();
    broker.inject("in", json!({ "id": 0 }).to_string());

    let mut runner = PipelineRunner::new(
        Arc::new(broker.connector()),
        Watcher {
            broker: broker.clone(),
            seen: Vec::new(),
        },
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    runner.run(std::future::pending()).await.unwrap();

    assert_eq!(runner.stage().unwrap().seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_output_before_a_crash_is_kept() {
    let broker = MemoryBroker::new();
    broker.inject("in", json!({ "id": 4, "crash_after": 1 }).to_string());

    let mut runner = PipelineRunner::new(
        Arc::new(broker.connector()),
        Fanout,
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    let err = runner.run(std::future::pending()).await.unwrap_err();

    assert!(matches!(err, RunnerError::StagePanicked(_)));
    assert_eq!(outputs(&broker), vec![(4, 0), (4, 1)]);
}

#[tokio::test]
async fn test_rejected_message_does_not_stop_the_worker() {
    let broker = MemoryBroker::new();
    broker.inject("in", json!({ "id": 5, "reject": true }).to_string());
    broker.inject("in", json!({ "id": 6 }).to_string());

    let mut runner = PipelineRunner::new(
        Arc::new(broker.connector()),
        Fanout,
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    runner.run(std::future::pending()).await.unwrap();

    assert_eq!(outputs(&broker), vec![(6, 0), (6, 1), (6, 2)]);
    assert_eq!(runner.metrics().snapshot().stage_failures, 1);
    assert_eq!(broker.depth("in"), 0);
}

fn scan_spec(source: Source, rule: RuleSpec) -> ScanSpecMessage {
    ScanSpecMessage {
        scan_tag: ScanTag::new("pipeline-test"),
        source,
        rule,
        configuration: ScanConfiguration::default(),
    }
}

async fn run_pipeline(broker: &MemoryBroker, queues: &QueueNames) {
    let mut explorer = PipelineRunner::new(
        Arc::new(broker.connector()),
        ExplorerStage::new(
            queues.clone(),
            Arc::new(DerivedSourceTable::with_defaults()),
            ModelSettings::default(),
            8,
        ),
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    explorer.run(std::future::pending()).await.unwrap();

    let mut processor = PipelineRunner::new(
        Arc::new(broker.connector()),
        ProcessorStage::new(
            queues.clone(),
            Arc::new(ConversionRegistry::with_defaults()),
            ModelSettings::default(),
        ),
        Box::new(MemoryOutbox::new()),
        settings(),
    );
    processor.run(std::future::pending()).await.unwrap();
}

#[tokio::test]
async fn test_explore_and_match_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("clean.txt"), "nothing to see").unwrap();
    fs::write(temp_dir.path().join("leak.txt"), "cpr 010203-1234 here").unwrap();
    fs::write(
        temp_dir.path().join("page.html"),
        "<html><body><p>cpr <b>111111-2222</b></p></body></html>",
    )
    .unwrap();

    let queues = QueueNames::default();
    let broker = MemoryBroker::new();
    let spec = scan_spec(
        Source::File(FilesystemSource::new(temp_dir.path())),
        RuleSpec::regex(r"\d{6}-\d{4}"),
    );
    broker.inject(&queues.scan_specs, serde_json::to_vec(&spec).unwrap());

    run_pipeline(&broker, &queues).await;

    let handles: Vec<HandlesMessage> = broker
        .drain(&queues.handles)
        .iter()
        .map(|b| serde_json::from_slice(b).unwrap())
        .collect();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].handles.len(), 3);

    let mut matches: Vec<MatchesMessage> = broker
        .drain(&queues.matches)
        .iter()
        .map(|b| serde_json::from_slice(b).unwrap())
        .collect();
    matches.sort_by_key(|m| m.handle.relative_path().to_string());
    assert_eq!(matches.len(), 3);

    assert_eq!(matches[0].handle.relative_path(), "clean.txt");
    assert!(!matches[0].matched);
    assert_eq!(matches[1].handle.relative_path(), "leak.txt");
    assert_eq!(matches[1].matches[0].text, "010203-1234");
    assert_eq!(matches[2].handle.relative_path(), "page.html");
    assert_eq!(matches[2].matches[0].text, "111111-2222");

    assert_eq!(broker.depth(&queues.problems), 0);
    assert_eq!(broker.depth(&queues.conversions), 0);
    assert_eq!(broker.depth(&queues.scan_specs), 0);
}

#[tokio::test]
async fn test_inline_zip_is_scanned_and_bad_spec_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let zip_path = temp_dir.path().join("data.zip");
    {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(fs::File::create(&zip_path).unwrap());
        writer
            .start_file("inside.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"the secret").unwrap();
        writer.finish().unwrap();
    }

    let queues = QueueNames::default();
    let broker = MemoryBroker::new();
    let spec = scan_spec(
        Source::Data(DataSource::new(
            fs::read(&zip_path).unwrap(),
            "application/zip",
            Some("data.zip".to_string()),
        )),
        RuleSpec::regex("secret"),
    );
    broker.inject(&queues.scan_specs, serde_json::to_vec(&spec).unwrap());
    broker.inject(&queues.scan_specs, "{\"not\": \"a scan spec\"}");

    run_pipeline(&broker, &queues).await;

    let matches: Vec<MatchesMessage> = broker
        .drain(&queues.matches)
        .iter()
        .map(|b| serde_json::from_slice(b).unwrap())
        .collect();
    assert_eq!(matches.len(), 1);
    assert!(matches[0].matched);
    assert_eq!(matches[0].handle.to_string(), "file inside.txt of data.zip");

    let problems: Vec<ProblemMessage> = broker
        .drain(&queues.problems)
        .iter()
        .map(|b| serde_json::from_slice(b).unwrap())
        .collect();
    assert!(problems.is_empty());
}

#[tokio::test]
async fn test_conversion_outside_the_scanned_root_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("share");
    fs::create_dir(&root).unwrap();
    fs::write(temp_dir.path().join("secret.txt"), "cpr 010203-1234").unwrap();

    let queues = QueueNames::default();
    let broker = MemoryBroker::new();
    let source = Arc::new(Source::File(FilesystemSource::new(&root)));
    let request = ConversionMessage {
        scan_spec: scan_spec((*source).clone(), RuleSpec::regex(r"\d{6}-\d{4}")),
        handle: Handle::new(source, "../secret.txt"),
    };
    broker.inject(&queues.conversions, serde_json::to_vec(&request).unwrap());

    run_pipeline(&broker, &queues).await;

    assert_eq!(broker.depth(&queues.matches), 0);
    let problems: Vec<ProblemMessage> = broker
        .drain(&queues.problems)
        .iter()
        .map(|b| serde_json::from_slice(b).unwrap())
        .collect();
    assert_eq!(problems.len(), 1);
    assert!(problems[0].message.contains("outside"));
}
