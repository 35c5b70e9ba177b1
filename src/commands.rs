use crate::cli::{ExploreArgs, ScanArgs, StageKind};
use nestscan::config::Config;
use nestscan::conversions::ConversionRegistry;
use nestscan::model::{
    DataSource, DerivedSourceTable, FilesystemSource, Source, SourceManager, Visit, Walker, mime,
};
use nestscan::pipeline::amqp::broker_uri;
use nestscan::pipeline::{
    AmqpConnector, Connector, ExplorerStage, FjallOutbox, MatchesMessage, MemoryBroker,
    MemoryOutbox, Outbox, PipelineRunner, ProblemMessage, ProcessorStage, ScanConfiguration,
    ScanSpecMessage, ScanTag, Stage,
};
use nestscan::rules::RuleSpec;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn worker(config: Config, kind: StageKind) -> Result<(), AnyError> {
    let uri = broker_uri(
        &config.broker.url,
        config.broker.user.as_deref(),
        config.broker.password.as_deref(),
    )?;
    let connector: Arc<dyn Connector> = Arc::new(AmqpConnector::new(uri, config.broker.prefetch));
    let outbox = open_outbox(&config)?;

    match kind {
        StageKind::Explorer => run_worker(connector, explorer_stage(&config), outbox, &config).await,
        StageKind::Processor => {
            run_worker(connector, processor_stage(&config), outbox, &config).await
        }
    }
}

async fn run_worker<S: Stage>(
    connector: Arc<dyn Connector>,
    stage: S,
    outbox: Box<dyn Outbox>,
    config: &Config,
) -> Result<(), AnyError> {
    info!(stage = stage.name(), "Starting worker");
    let mut runner = PipelineRunner::new(connector, stage, outbox, config.runner_settings());
    let result = runner.run(shutdown_signal()).await;
    info!(metrics = ?runner.metrics().snapshot(), pending = runner.pending(), "Worker stopped");
    result?;
    Ok(())
}

pub async fn submit(config: Config, args: ScanArgs) -> Result<(), AnyError> {
    let spec = scan_spec(&args)?;
    let uri = broker_uri(
        &config.broker.url,
        config.broker.user.as_deref(),
        config.broker.password.as_deref(),
    )?;
    let connector = AmqpConnector::new(uri, config.broker.prefetch);

    let mut transport = connector.connect().await?;
    transport.declare(&config.queues.scan_specs).await?;
    transport
        .publish(&config.queues.scan_specs, &serde_json::to_vec(&spec)?)
        .await?;
    transport.close().await?;

    info!(scan_id = %spec.scan_tag.scan_id, queue = %config.queues.scan_specs, "Scan submitted");
    println!("{}", spec.scan_tag.scan_id);
    Ok(())
}

pub fn explore(config: Config, args: ExploreArgs) -> Result<(), AnyError> {
    let source = Arc::new(source_for_path(&args.path)?);
    let walker = Walker::new(
        Arc::new(DerivedSourceTable::with_defaults()),
        args.max_depth.unwrap_or(config.model.max_depth),
    );
    let sm = SourceManager::new(config.model_settings());

    walker.walk(&source, &sm, &mut |visit| {
        let depth = visit.handle().map_or(0, |h| h.source().depth());
        let pad = "  ".repeat(depth);
        match &visit {
            Visit::Leaf(h) => println!("{pad}{h}"),
            Visit::Container(h) => println!("{pad}{h}:"),
            Visit::Degraded(h, err) => println!("{pad}{h} [unreadable: {err}]"),
            Visit::TooDeep(h) => println!("{pad}{h} [depth limit]"),
            Visit::Problem(Some(h), err) => println!("{pad}{h} [error: {err}]"),
            Visit::Problem(None, err) => println!("{pad}[error: {err}]"),
        }
    })?;

    sm.close_all();
    info!(stats = ?sm.stats(), "Exploration finished");
    Ok(())
}

/// Runs the explorer and then the processor over an in-process broker.
pub async fn scan(config: Config, args: ScanArgs) -> Result<(), AnyError> {
    let spec = scan_spec(&args)?;
    let broker = MemoryBroker::new();
    broker.inject(&config.queues.scan_specs, serde_json::to_vec(&spec)?);
    let connector: Arc<dyn Connector> = Arc::new(broker.connector());

    let mut explorer = PipelineRunner::new(
        connector.clone(),
        explorer_stage(&config),
        Box::new(MemoryOutbox::new()),
        config.runner_settings(),
    );
    explorer.run(std::future::pending()).await?;

    let mut processor = PipelineRunner::new(
        connector,
        processor_stage(&config),
        Box::new(MemoryOutbox::new()),
        config.runner_settings(),
    );
    processor.run(std::future::pending()).await?;

    let mut matched = 0;
    for body in broker.drain(&config.queues.matches) {
        let message: MatchesMessage = serde_json::from_slice(&body)?;
        if !message.matched {
            continue;
        }
        matched += 1;
        println!("{}", message.handle);
        for fragment in &message.matches {
            println!("    {}", fragment.context.replace('\n', " "));
        }
    }
    for body in broker.drain(&config.queues.problems) {
        let problem: ProblemMessage = serde_json::from_slice(&body)?;
        match &problem.handle {
            Some(handle) => eprintln!("problem: {handle}: {}", problem.message),
            None => eprintln!("problem: {}", problem.message),
        }
    }

    info!(scan_id = %spec.scan_tag.scan_id, matched, "Scan finished");
    Ok(())
}

/// Credentials are never part of the output.
pub fn show_config(config: &Config) -> Result<(), AnyError> {
    print!("{}", config.to_toml()?);
    Ok(())
}

fn explorer_stage(config: &Config) -> ExplorerStage {
    ExplorerStage::new(
        config.queues.clone(),
        Arc::new(DerivedSourceTable::with_defaults()),
        config.model_settings(),
        config.model.max_depth,
    )
}

fn processor_stage(config: &Config) -> ProcessorStage {
    ProcessorStage::new(
        config.queues.clone(),
        Arc::new(ConversionRegistry::with_defaults()),
        config.model_settings(),
    )
}

fn open_outbox(config: &Config) -> Result<Box<dyn Outbox>, AnyError> {
    let outbox: Box<dyn Outbox> = match &config.outbox.path {
        Some(path) => Box::new(FjallOutbox::open(path)?),
        None => Box::new(MemoryOutbox::new()),
    };
    Ok(outbox)
}

/// Directories become filesystem sources; single files are sent inline.
fn source_for_path(path: &Path) -> std::io::Result<Source> {
    let path = path.canonicalize()?;
    if path.is_dir() {
        return Ok(Source::File(FilesystemSource::new(path)));
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let content = std::fs::read(&path)?;
    Ok(Source::Data(DataSource::new(
        content,
        mime::guess_from_name(&name),
        Some(name),
    )))
}

fn scan_spec(args: &ScanArgs) -> Result<ScanSpecMessage, AnyError> {
    let rule = match &args.regex {
        Some(expression) => RuleSpec::Regex {
            expression: expression.clone(),
            case_sensitive: args.case_sensitive,
        },
        None => RuleSpec::Always,
    };
    // Reject bad expressions here rather than as a problem per object.
    rule.compile()?;

    Ok(ScanSpecMessage {
        scan_tag: ScanTag::new(format!("nestscan@{}", hostname())),
        source: source_for_path(&args.path)?,
        rule,
        configuration: ScanConfiguration {
            skip_images: args.skip_images.then_some(true),
            max_depth: args.max_depth,
        },
    })
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
