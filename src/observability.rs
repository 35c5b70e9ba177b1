//! Logging setup and in-process counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. Calling this twice is harmless; the second call is ignored.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Counters kept by a pipeline worker
#[derive(Debug, Default)]
pub struct Metrics {
    received: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    reconnects: AtomicU64,
    problems: AtomicU64,
    stage_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "received", "Metric incremented");
    }

    pub fn message_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "published", "Metric incremented");
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "publish_failures", "Metric incremented");
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "reconnects", "Metric incremented");
    }

    pub fn problem_reported(&self) {
        self.problems.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "problems", "Metric incremented");
    }

    pub fn stage_failed(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "stage_failures", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            problems: self.problems.load(Ordering::Relaxed),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub reconnects: u64,
    pub problems: u64,
    pub stage_failures: u64,
}
