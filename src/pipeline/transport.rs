//! Broker abstraction used by the pipeline runner.
//!
//! A [`Connector`] creates [`Transport`]s; a transport is one connection and
//! channel and is thrown away as a whole when it breaks. Nothing the runner
//! needs to keep (pending output in particular) lives inside a transport.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection broke; reconnecting may help.
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// Protocol or authentication failure; retrying will not help.
    #[error("Fatal transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A message received from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub tag: u64,
    pub body: Bytes,
}

#[async_trait]
pub trait Transport: Send {
    /// Declares a durable, non-exclusive, non-auto-deleting queue.
    async fn declare(&mut self, queue: &str) -> Result<()>;

    /// Starts consuming from `queues`.
    async fn consume(&mut self, queues: &[String]) -> Result<()>;

    /// Waits for the next delivery. `None` means the input is exhausted and
    /// no more deliveries will arrive on this transport.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Publishes `body` to `queue` through the default exchange and waits
    /// for the broker to confirm it.
    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}
