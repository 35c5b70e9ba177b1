//! Pending outbound messages, kept apart from any transport so they survive
//! reconnection (and, for [`FjallOutbox`], process restarts).

use super::messages::Outgoing;
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Corrupt outbox entry: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

/// FIFO of messages produced but not yet confirmed by the broker.
pub trait Outbox: Send {
    fn push(&mut self, message: Outgoing) -> Result<()>;

    /// The oldest pending message, without removing it.
    fn front(&self) -> Result<Option<Outgoing>>;

    /// Removes the oldest pending message once it has been delivered.
    fn pop_front(&mut self) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemoryOutbox {
    pending: VecDeque<Outgoing>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Outbox for MemoryOutbox {
    fn push(&mut self, message: Outgoing) -> Result<()> {
        self.pending.push_back(message);
        Ok(())
    }

    fn front(&self) -> Result<Option<Outgoing>> {
        Ok(self.pending.front().cloned())
    }

    fn pop_front(&mut self) -> Result<()> {
        self.pending.pop_front();
        Ok(())
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Outbox stored in a fjall keyspace.
///
/// Layout: `pending` partition, u64 (big-endian) sequence → JSON [`Outgoing`].
/// Big-endian keys make the partition's key order the production order.
pub struct FjallOutbox {
    keyspace: Keyspace,
    pending: PartitionHandle,
    next_seq: u64,
    len: usize,
}

impl FjallOutbox {
    /// Open or create an outbox at `path`, resuming whatever is pending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening outbox at: {}", path.as_ref().display());

        let keyspace = Config::new(path).open()?;
        let pending = keyspace.open_partition("pending", PartitionCreateOptions::default())?;

        let next_seq = match pending.iter().next_back() {
            Some(entry) => {
                let (key, _) = entry?;
                decode_seq(&key) + 1
            }
            None => 0,
        };
        let mut len = 0;
        for entry in pending.iter() {
            entry?;
            len += 1;
        }

        info!(pending = len, next_seq, "Outbox opened");
        Ok(Self {
            keyspace,
            pending,
            next_seq,
            len,
        })
    }

    fn persist(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

fn decode_seq(key: &[u8]) -> u64 {
    u64::from_be_bytes(key.try_into().unwrap_or([0u8; 8]))
}

impl Outbox for FjallOutbox {
    fn push(&mut self, message: Outgoing) -> Result<()> {
        let seq = self.next_seq;
        let value = serde_json::to_vec(&message)?;
        self.pending.insert(seq.to_be_bytes(), value)?;
        self.persist()?;

        self.next_seq += 1;
        self.len += 1;
        debug!(seq, queue = %message.queue, "Message queued for dispatch");
        Ok(())
    }

    fn front(&self) -> Result<Option<Outgoing>> {
        match self.pending.iter().next() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(serde_json::from_slice(&value)?))
            }
            None => Ok(None),
        }
    }

    fn pop_front(&mut self) -> Result<()> {
        if let Some(entry) = self.pending.iter().next() {
            let (key, _) = entry?;
            self.pending.remove(key)?;
            self.persist()?;
            self.len = self.len.saturating_sub(1);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn message(n: u64) -> Outgoing {
        Outgoing {
            queue: "q".to_string(),
            body: json!({ "n": n }),
        }
    }

    fn exercise(outbox: &mut dyn Outbox) {
        assert!(outbox.is_empty());
        for n in 0..3 {
            outbox.push(message(n)).unwrap();
        }
        assert_eq!(outbox.len(), 3);
        for n in 0..3 {
            assert_eq!(outbox.front().unwrap(), Some(message(n)));
            outbox.pop_front().unwrap();
        }
        assert!(outbox.front().unwrap().is_none());
    }

    #[test]
    fn test_memory_outbox_is_fifo() {
        exercise(&mut MemoryOutbox::new());
    }

    #[test]
    fn test_fjall_outbox_is_fifo() {
        let temp_dir = TempDir::new().unwrap();
        exercise(&mut FjallOutbox::open(temp_dir.path()).unwrap());
    }

    #[test]
    fn test_fjall_outbox_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut outbox = FjallOutbox::open(temp_dir.path()).unwrap();
            outbox.push(message(1)).unwrap();
            outbox.push(message(2)).unwrap();
            outbox.pop_front().unwrap();
        }

        let mut outbox = FjallOutbox::open(temp_dir.path()).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.front().unwrap(), Some(message(2)));

        outbox.push(message(3)).unwrap();
        outbox.pop_front().unwrap();
        assert_eq!(outbox.front().unwrap(), Some(message(3)));
    }
}
