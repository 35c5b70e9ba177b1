//! Message-driven stage execution.
//!
//! A [`PipelineRunner`] consumes JSON messages for one [`Stage`] from a
//! broker reached through a [`Connector`], and publishes what the stage
//! produces through an [`Outbox`] that outlives any single connection.

pub mod amqp;
pub mod memory;
pub mod messages;
pub mod outbox;
pub mod runner;
pub mod stages;
pub mod transport;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, MemoryConnector};
pub use messages::{
    ConversionMessage, HandlesMessage, MatchesMessage, Outgoing, ProblemMessage,
    ScanConfiguration, ScanSpecMessage, ScanTag,
};
pub use outbox::{FjallOutbox, MemoryOutbox, Outbox, OutboxError};
pub use runner::{PipelineRunner, RunnerError, RunnerSettings};
pub use stages::{ExplorerStage, ProcessorStage, QueueNames, Stage};
pub use transport::{Connector, Delivery, Transport, TransportError};
