//! The durable message log: a partitioned, append-only stream with
//! consumer-group semantics.
//!
//! All messages of a conversation land on the same partition and each
//! partition has exactly one consumer per deployment, which is what gives
//! per-conversation FIFO. Entries stay pending until acknowledged; entries
//! that exhaust their retries are appended to a separate dead-letter stream.

mod dlq;
mod jetstream;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::MessageEnvelope;
use thiserror::Error;

pub use dlq::{DeadLetterRecord, DeadLetterSource, replay_dead_letter};
pub use jetstream::{JetStreamLog, list_dead_letters};
pub use memory::MemoryLog;

pub type SharedLog = Arc<dyn PartitionedLog>;

/// Monotone per-partition entry identifier assigned at append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An entry leased to the partition's consumer, not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: EntryId,
    pub envelope: MessageEnvelope,
    /// How many times this entry has been delivered (1 on first delivery).
    pub delivery_count: u32,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("append failed: {0}")]
    Append(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("ack failed: {0}")]
    Ack(String),
    #[error("dead-letter publish failed: {0}")]
    DeadLetter(String),
}

#[async_trait]
pub trait PartitionedLog: Send + Sync {
    /// Appends an envelope to a partition and returns its monotone entry id.
    async fn append(&self, partition: u32, envelope: &MessageEnvelope)
    -> Result<EntryId, LogError>;

    /// Blocking read of up to `max` entries for this partition's consumer.
    /// Waits up to `wait` when nothing is deliverable; entries already leased
    /// are redelivered once their idle lease lapses.
    async fn read_batch(
        &self,
        partition: u32,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<PendingEntry>, LogError>;

    /// Acknowledges delivered entries, removing them from pending.
    async fn ack(&self, partition: u32, ids: &[EntryId]) -> Result<(), LogError>;

    /// Delivered-but-unacknowledged count, for backpressure monitoring.
    async fn pending(&self, partition: u32) -> Result<u64, LogError>;

    /// Appends a record to the dead-letter stream.
    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<(), LogError>;
}
