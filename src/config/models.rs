use crate::humanize::ByteSize;
use crate::model::ModelSettings;
use crate::observability::LogFormat;
use crate::pipeline::{QueueNames, RunnerSettings};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub queues: QueueNames,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub subprocess: SubprocessConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Source manager settings for workers built from this configuration.
    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings::builder()
            .width(self.model.width)
            .spool_threshold(self.model.spool_threshold)
            .subprocess_timeout(Duration::from_secs(self.subprocess.timeout_secs))
            .skip_images(self.model.skip_images)
            .build()
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            reconnect_delay: Duration::from_millis(self.broker.reconnect_delay_ms),
        }
    }
}

/// Message broker connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Broker user (loaded from environment, not from config file)
    #[serde(skip)]
    pub user: Option<String>,
    /// Broker password (loaded from environment, not from config file)
    #[serde(skip)]
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            prefetch: default_prefetch(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            user: None,
            password: None,
        }
    }
}

fn default_broker_url() -> String {
    "amqp://localhost:5672/%2f".to_string()
}

fn default_prefetch() -> u16 {
    1
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

/// Exploration limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Maximum simultaneously open source sessions per worker
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_spool_threshold")]
    pub spool_threshold: ByteSize,
    #[serde(default)]
    pub skip_images: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            max_depth: default_max_depth(),
            spool_threshold: default_spool_threshold(),
            skip_images: false,
        }
    }
}

fn default_width() -> usize {
    3
}

fn default_max_depth() -> usize {
    crate::model::walk::DEFAULT_MAX_DEPTH
}

fn default_spool_threshold() -> ByteSize {
    ByteSize::mib(8)
}

/// External converter tools
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubprocessConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    180
}

/// Pending outbound messages. Without a path they are kept in memory only.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutboxConfig {
    pub path: Option<PathBuf>,
}

/// Telemetry configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_format: LogFormat,
}
