//! Message loop driving one [`Stage`] against a broker.
//!
//! Per session: connect, declare every queue the stage touches, flush the
//! outbox, then consume. Each delivery is acknowledged on receipt and handed
//! to the stage on the blocking pool. Every message the stage emits goes into
//! the outbox and is published before the stage carries on. A transient
//! transport error ends the session with the unpublished remainder still in
//! the outbox; the next session sends it before taking new work.

use super::messages::Outgoing;
use super::outbox::{Outbox, OutboxError};
use super::stages::Stage;
use super::transport::{Connector, Transport, TransportError};
use crate::observability::Metrics;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Stage panicked: {0}")]
    StagePanicked(String),

    #[error("Stage is no longer available")]
    StageLost,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub reconnect_delay: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

enum SessionEnd {
    /// The transport reported that no more deliveries will arrive.
    Drained,
    Shutdown,
}

pub struct PipelineRunner<S: Stage> {
    connector: Arc<dyn Connector>,
    stage: Option<S>,
    outbox: Box<dyn Outbox>,
    settings: RunnerSettings,
    metrics: Arc<Metrics>,
}

impl<S: Stage> PipelineRunner<S> {
    pub fn new(
        connector: Arc<dyn Connector>,
        stage: S,
        outbox: Box<dyn Outbox>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            connector,
            stage: Some(stage),
            outbox,
            settings,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn stage(&self) -> Option<&S> {
        self.stage.as_ref()
    }

    /// Messages produced but not yet confirmed by the broker.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Runs sessions until `shutdown` resolves, the input drains, or a
    /// fatal error occurs. Transient failures reconnect indefinitely.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), RunnerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            match self.session(&mut shutdown).await {
                Ok(SessionEnd::Drained) => {
                    info!(pending = self.outbox.len(), "Input drained, stopping");
                    return Ok(());
                }
                Ok(SessionEnd::Shutdown) => {
                    info!(pending = self.outbox.len(), "Shutdown requested, stopping");
                    return Ok(());
                }
                Err(RunnerError::Transport(err)) if err.is_transient() => {
                    self.metrics.reconnected();
                    warn!(
                        error = %err,
                        pending = self.outbox.len(),
                        delay_ms = self.settings.reconnect_delay.as_millis() as u64,
                        "Connection lost, reconnecting"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.as_mut() => return Ok(()),
                        _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "Runner stopped");
                    return Err(err);
                }
            }
        }
    }

    async fn session<F>(&mut self, shutdown: &mut Pin<&mut F>) -> Result<SessionEnd, RunnerError>
    where
        F: Future<Output = ()>,
    {
        let stage = self.stage.as_ref().ok_or(RunnerError::StageLost)?;
        let name = stage.name();
        let read_queues = stage.read_queues();
        let write_queues = stage.write_queues();
        let problem_queue = stage.problem_queue().to_string();

        let mut transport = self.connector.connect().await?;
        for queue in read_queues.iter().chain(write_queues.iter()) {
            transport.declare(queue).await?;
        }
        let flushed = self.dispatch_pending(transport.as_mut()).await?;
        transport.consume(&read_queues).await?;
        info!(stage = name, queues = ?read_queues, flushed, "Consuming");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.as_mut() => None,
                delivery = transport.next_delivery() => Some(delivery),
            };
            let Some(delivery) = next else {
                if let Err(err) = self.dispatch_pending(transport.as_mut()).await {
                    warn!(error = %err, pending = self.outbox.len(), "Final flush failed");
                }
                close(transport.as_mut()).await;
                return Ok(SessionEnd::Shutdown);
            };
            let Some(delivery) = delivery? else {
                close(transport.as_mut()).await;
                return Ok(SessionEnd::Drained);
            };

            self.metrics.message_received();
            // Never take on new work while earlier output is undelivered.
            self.dispatch_pending(transport.as_mut()).await?;
            transport.ack(&delivery).await?;

            let body: Value = match serde_json::from_slice(&delivery.body) {
                Ok(body) => body,
                Err(err) => {
                    warn!(queue = %delivery.queue, tag = delivery.tag, error = %err, "Dropping non-JSON message");
                    continue;
                }
            };

            let produced = self
                .run_stage(body, delivery.queue.clone(), transport.as_mut(), &problem_queue)
                .await?;
            debug!(queue = %delivery.queue, tag = delivery.tag, produced, "Message handled");
        }
    }

    /// Runs the stage on the blocking pool while storing and publishing what
    /// it emits. The stage waits for each message to be handled before it
    /// continues. After a failed publish the remaining output is only stored,
    /// and the failure is returned once the stage has finished.
    async fn run_stage(
        &mut self,
        body: Value,
        queue: String,
        transport: &mut dyn Transport,
        problem_queue: &str,
    ) -> Result<usize, RunnerError> {
        let mut stage = self.stage.take().ok_or(RunnerError::StageLost)?;
        let name = stage.name();
        let (tx, mut rx) = mpsc::channel::<(Outgoing, oneshot::Sender<()>)>(1);

        let worker = tokio::task::spawn_blocking(move || {
            let mut emit = |message: Outgoing| {
                let (stored_tx, stored_rx) = oneshot::channel();
                if tx.blocking_send((message, stored_tx)).is_err() || stored_rx.blocking_recv().is_err() {
                    warn!(stage = name, "Runner stopped accepting output, message dropped");
                }
            };
            let result = stage.handle_message(&body, &queue, &mut emit);
            (stage, result)
        });

        let mut produced = 0;
        let mut failed: Option<RunnerError> = None;
        while let Some((message, stored)) = rx.recv().await {
            produced += 1;
            if message.queue == problem_queue {
                self.metrics.problem_reported();
            }
            let result = match self.outbox.push(message) {
                Ok(()) if failed.is_none() => self.dispatch_pending(transport).await.map(drop),
                Ok(()) => Ok(()),
                Err(err) => Err(RunnerError::from(err)),
            };
            if let Err(err) = result {
                failed.get_or_insert(err);
            }
            if stored.send(()).is_err() {
                debug!(stage = name, "Stage stopped waiting for its output");
            }
        }

        let (stage, result) = worker
            .await
            .map_err(|err| RunnerError::StagePanicked(err.to_string()))?;
        self.stage = Some(stage);
        if let Err(err) = result {
            self.metrics.stage_failed();
            error!(stage = name, error = %err, produced, "Stage failed on message, continuing");
        }

        match failed {
            Some(err) => Err(err),
            None => Ok(produced),
        }
    }

    /// Publishes the outbox front to back, stopping at the first failure.
    async fn dispatch_pending(&mut self, transport: &mut dyn Transport) -> Result<usize, RunnerError> {
        let mut sent = 0;
        while let Some(message) = self.outbox.front()? {
            let body = serde_json::to_vec(&message.body)?;
            if let Err(err) = transport.publish(&message.queue, &body).await {
                self.metrics.publish_failed();
                warn!(
                    queue = %message.queue,
                    pending = self.outbox.len(),
                    error = %err,
                    "Publish failed, message kept for retry"
                );
                return Err(err.into());
            }
            self.outbox.pop_front()?;
            self.metrics.message_published();
            sent += 1;
        }
        Ok(sent)
    }
}

async fn close(transport: &mut dyn Transport) {
    if let Err(err) = transport.close().await {
        debug!(error = %err, "Closing transport failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::memory::MemoryBroker;
    use crate::pipeline::outbox::MemoryOutbox;
    use serde_json::json;

    /// Forwards every message to "out", as many times as asked to.
    struct Echo;

    impl Stage for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn read_queues(&self) -> Vec<String> {
            vec!["in".to_string()]
        }

        fn write_queues(&self) -> Vec<String> {
            vec!["out".to_string(), "problems".to_string()]
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
            if body.get("panic").is_some() {
                panic!("boom");
            }
            if body.get("fail").is_some() {
                return Err(serde::de::Error::custom("refusing message"));
            }
            let copies = body.get("copies").and_then(Value::as_u64).unwrap_or(1);
            for i in 0..copies {
                emit(Outgoing {
                    queue: "out".to_string(),
                    body: json!({ "n": body["n"], "copy": i }),
                });
            }
            if body.get("problem").is_some() {
                emit(Outgoing {
                    queue: "problems".to_string(),
                    body: json!({ "n": body["n"] }),
                });
            }
            Ok(())
        }
    }

    fn runner(broker: &MemoryBroker) -> PipelineRunner<Echo> {
        PipelineRunner::new(
            Arc::new(broker.connector()),
            Echo,
            Box::new(MemoryOutbox::new()),
            RunnerSettings {
                reconnect_delay: Duration::from_millis(1),
            },
        )
    }

    fn bodies(broker: &MemoryBroker, queue: &str) -> Vec<Value> {
        broker
            .drain(queue)
            .iter()
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_preserves_production_order() {
        let broker = MemoryBroker::new();
        for n in 0..3 {
            broker.inject("in", json!({ "n": n, "copies": 2 }).to_string());
        }
        let mut runner = runner(&broker);
        runner.run(std::future::pending()).await.unwrap();

        let ns: Vec<(u64, u64)> = bodies(&broker, "out")
            .iter()
            .map(|b| (b["n"].as_u64().unwrap(), b["copy"].as_u64().unwrap()))
            .collect();
        assert_eq!(ns, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
        assert_eq!(runner.metrics().snapshot().received, 3);
        assert_eq!(runner.metrics().snapshot().published, 6);
    }

    #[tokio::test]
    async fn test_non_json_is_acked_and_skipped() {
        let broker = MemoryBroker::new();
        broker.inject("in", "not json");
        broker.inject("in", json!({ "n": 1 }).to_string());
        let mut runner = runner(&broker);
        runner.run(std::future::pending()).await.unwrap();

        assert_eq!(bodies(&broker, "out").len(), 1);
        assert_eq!(broker.depth("in"), 0);
    }

    #[tokio::test]
    async fn test_problems_are_counted() {
        let broker = MemoryBroker::new();
        broker.inject("in", json!({ "n": 1, "problem": true }).to_string());
        let mut runner = runner(&broker);
        runner.run(std::future::pending()).await.unwrap();
        assert_eq!(runner.metrics().snapshot().problems, 1);
        assert_eq!(broker.depth("problems"), 1);
    }

    #[tokio::test]
    async fn test_stage_panic_is_fatal() {
        let broker = MemoryBroker::new();
        broker.inject("in", json!({ "panic": true }).to_string());
        let mut runner = runner(&broker);
        let err = runner.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, RunnerError::StagePanicked(_)));
    }

    #[tokio::test]
    async fn test_stage_error_does_not_stop_the_worker() {
        let broker = MemoryBroker::new();
        broker.inject("in", json!({ "n": 1, "fail": true }).to_string());
        broker.inject("in", json!({ "n": 2 }).to_string());
        let mut runner = runner(&broker);
        runner.run(std::future::pending()).await.unwrap();

        let out = bodies(&broker, "out");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["n"], 2);
        let metrics = runner.metrics().snapshot();
        assert_eq!(metrics.received, 2);
        assert_eq!(metrics.stage_failures, 1);
        assert!(runner.stage().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_consuming() {
        let broker = MemoryBroker::new();
        broker.inject("in", json!({ "n": 1 }).to_string());
        let mut runner = runner(&broker);
        runner.run(std::future::ready(())).await.unwrap();
        assert_eq!(broker.depth("in"), 1);
    }
}
