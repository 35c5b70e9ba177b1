//! In-process broker for local runs and tests.
//!
//! Connections are tracked by an epoch: dropping "the" connection bumps the
//! epoch, every transport created before that fails with a transient error
//! from then on, and deliveries they had not acknowledged go back to the
//! front of their queues, as an AMQP broker would redeliver them.

use super::transport::{Connector, Delivery, Result, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct Faults {
    drop_before_publish: Option<u64>,
    drop_after_publish: Option<u64>,
    refuse_credentials: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Bytes>>,
    unacked: BTreeMap<u64, (u64, String, Bytes)>,
    epoch: u64,
    next_tag: u64,
    publish_attempts: u64,
    connections: u64,
    faults: Faults,
}

impl BrokerState {
    fn drop_connections(&mut self) {
        self.epoch += 1;
        // Redeliver in original order ahead of newer messages.
        let unacked = std::mem::take(&mut self.unacked);
        for (_, (_, queue, body)) in unacked.into_iter().rev() {
            self.queues.entry(queue).or_default().push_front(body);
        }
        info!(epoch = self.epoch, "Memory broker dropped its connections");
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock cannot leave the queues half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Adds a message directly, bypassing any transport.
    pub fn inject(&self, queue: &str, body: impl Into<Bytes>) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(body.into());
    }

    /// Removes and returns everything currently in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Bytes> {
        self.lock()
            .queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Number of connections opened so far.
    pub fn connections(&self) -> u64 {
        self.lock().connections
    }

    /// Drops all connections now.
    pub fn drop_connections(&self) {
        self.lock().drop_connections();
    }

    /// The `n`th publish attempt from now (1-based) finds the connection
    /// gone: the message is not stored and the publisher sees a transient
    /// error.
    pub fn drop_before_publish(&self, n: u64) {
        let mut state = self.lock();
        let at = state.publish_attempts + n;
        state.faults.drop_before_publish = Some(at);
    }

    /// The `n`th publish attempt from now is stored, but the connection dies
    /// before the confirmation reaches the publisher.
    pub fn drop_after_publish(&self, n: u64) {
        let mut state = self.lock();
        let at = state.publish_attempts + n;
        state.faults.drop_after_publish = Some(at);
    }

    /// Rejects every subsequent connection attempt as unauthorized.
    pub fn refuse_credentials(&self, refuse: bool) {
        self.lock().faults.refuse_credentials = refuse;
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let mut state = self.broker.lock();
        if state.faults.refuse_credentials {
            return Err(TransportError::fatal("ACCESS_REFUSED: login refused"));
        }
        state.connections += 1;
        debug!(epoch = state.epoch, "Memory broker connection opened");
        Ok(Box::new(MemoryTransport {
            broker: self.broker.clone(),
            epoch: state.epoch,
            consuming: Vec::new(),
            closed: false,
        }))
    }
}

pub struct MemoryTransport {
    broker: MemoryBroker,
    epoch: u64,
    consuming: Vec<String>,
    closed: bool,
}

impl MemoryTransport {
    fn live(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if self.closed || state.epoch != self.epoch {
            return Err(TransportError::transient("connection closed"));
        }
        Ok(state)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare(&mut self, queue: &str) -> Result<()> {
        self.live()?.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn consume(&mut self, queues: &[String]) -> Result<()> {
        let state = self.live()?;
        for queue in queues {
            if !state.queues.contains_key(queue) {
                return Err(TransportError::fatal(format!("NOT_FOUND: no queue '{queue}'")));
            }
        }
        drop(state);
        self.consuming = queues.to_vec();
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        let epoch = self.epoch;
        let consuming = self.consuming.clone();
        let mut state = self.live()?;
        for queue in consuming {
            let Some(body) = state.queues.get_mut(&queue).and_then(VecDeque::pop_front) else {
                continue;
            };
            state.next_tag += 1;
            let tag = state.next_tag;
            state.unacked.insert(tag, (epoch, queue.clone(), body.clone()));
            return Ok(Some(Delivery { queue, tag, body }));
        }
        Ok(None)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut state = self.live()?;
        state.unacked.remove(&delivery.tag);
        Ok(())
    }

    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<()> {
        let mut state = self.live()?;
        state.publish_attempts += 1;
        let attempt = state.publish_attempts;

        if state.faults.drop_before_publish == Some(attempt) {
            state.faults.drop_before_publish = None;
            state.drop_connections();
            return Err(TransportError::transient("connection lost before publish"));
        }

        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Bytes::copy_from_slice(body));

        if state.faults.drop_after_publish == Some(attempt) {
            state.faults.drop_after_publish = None;
            state.drop_connections();
            return Err(TransportError::transient("connection lost before confirm"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_consume_in_order() {
        let broker = MemoryBroker::new();
        let mut transport = broker.connector().connect().await.unwrap();
        transport.declare("q").await.unwrap();
        transport.publish("q", b"one").await.unwrap();
        transport.publish("q", b"two").await.unwrap();
        transport.consume(&["q".to_string()]).await.unwrap();

        let first = transport.next_delivery().await.unwrap().unwrap();
        transport.ack(&first).await.unwrap();
        let second = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.body.as_ref(), b"one");
        assert_eq!(second.body.as_ref(), b"two");
        assert!(transport.next_delivery().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered_after_drop() {
        let broker = MemoryBroker::new();
        broker.inject("q", "m");
        let mut transport = broker.connector().connect().await.unwrap();
        transport.consume(&["q".to_string()]).await.unwrap();
        let _delivery = transport.next_delivery().await.unwrap().unwrap();

        broker.drop_connections();
        assert!(transport.next_delivery().await.unwrap_err().is_transient());
        assert_eq!(broker.depth("q"), 1);
    }

    #[tokio::test]
    async fn test_drop_before_publish_loses_nothing_stored() {
        let broker = MemoryBroker::new();
        let mut transport = broker.connector().connect().await.unwrap();
        broker.drop_before_publish(1);

        let err = transport.publish("q", b"x").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(broker.depth("q"), 0);

        let mut fresh = broker.connector().connect().await.unwrap();
        fresh.publish("q", b"x").await.unwrap();
        assert_eq!(broker.depth("q"), 1);
    }

    #[tokio::test]
    async fn test_refused_credentials_are_fatal() {
        let broker = MemoryBroker::new();
        broker.refuse_credentials(true);
        let err = broker.connector().connect().await.err().unwrap();
        assert!(!err.is_transient());
    }
}
