use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_core::MessageEnvelope;
use tokio::sync::Notify;

use crate::{DeadLetterRecord, EntryId, LogError, PartitionedLog, PendingEntry};

enum EntryState {
    Ready,
    Pending { leased_at: Instant, deliveries: u32 },
}

struct Entry {
    id: u64,
    envelope: MessageEnvelope,
    state: EntryState,
}

#[derive(Default)]
struct Partition {
    next_id: u64,
    entries: VecDeque<Entry>,
}

/// In-process log used in tests and single-node runs. Entries stay in the
/// queue until acknowledged; a leased entry whose idle time lapses becomes
/// deliverable again at its original position, which preserves FIFO across
/// redelivery.
pub struct MemoryLog {
    partitions: Vec<Mutex<Partition>>,
    notifiers: Vec<Notify>,
    idle_timeout: Duration,
    dead_letters: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryLog {
    pub fn new(partitions: u32, idle_timeout: Duration) -> Self {
        let count = partitions.max(1) as usize;
        Self {
            partitions: (0..count).map(|_| Mutex::new(Partition::default())).collect(),
            notifiers: (0..count).map(|_| Notify::new()).collect(),
            idle_timeout,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Everything dead-lettered so far, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn partition(&self, partition: u32) -> Result<&Mutex<Partition>, LogError> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| LogError::Read(format!("unknown partition {partition}")))
    }

    fn take_deliverable(&self, partition: u32, max: usize) -> Result<Vec<PendingEntry>, LogError> {
        let now = Instant::now();
        let mut guard = self
            .partition(partition)?
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let mut batch = Vec::new();
        for entry in guard.entries.iter_mut() {
            if batch.len() >= max {
                break;
            }
            let deliveries = match &entry.state {
                EntryState::Ready => 1,
                EntryState::Pending { leased_at, deliveries }
                    if now.duration_since(*leased_at) >= self.idle_timeout =>
                {
                    deliveries + 1
                }
                EntryState::Pending { .. } => continue,
            };
            entry.state = EntryState::Pending {
                leased_at: now,
                deliveries,
            };
            batch.push(PendingEntry {
                id: EntryId(entry.id),
                envelope: entry.envelope.clone(),
                delivery_count: deliveries,
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl PartitionedLog for MemoryLog {
    async fn append(
        &self,
        partition: u32,
        envelope: &MessageEnvelope,
    ) -> Result<EntryId, LogError> {
        let id = {
            let mut guard = self
                .partition(partition)?
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            guard.next_id += 1;
            let id = guard.next_id;
            guard.entries.push_back(Entry {
                id,
                envelope: envelope.clone(),
                state: EntryState::Ready,
            });
            id
        };
        self.notifiers[partition as usize].notify_one();
        metrics::counter!("relay_log_appends_total").increment(1);
        Ok(EntryId(id))
    }

    async fn read_batch(
        &self,
        partition: u32,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<PendingEntry>, LogError> {
        let batch = self.take_deliverable(partition, max)?;
        if !batch.is_empty() {
            return Ok(batch);
        }
        let notified = self.notifiers[partition as usize].notified();
        let _ = tokio::time::timeout(wait, notified).await;
        self.take_deliverable(partition, max)
    }

    async fn ack(&self, partition: u32, ids: &[EntryId]) -> Result<(), LogError> {
        let mut guard = self
            .partition(partition)?
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        guard
            .entries
            .retain(|entry| !ids.contains(&EntryId(entry.id)));
        Ok(())
    }

    async fn pending(&self, partition: u32) -> Result<u64, LogError> {
        let guard = self
            .partition(partition)?
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        Ok(guard
            .entries
            .iter()
            .filter(|entry| matches!(entry.state, EntryState::Pending { .. }))
            .count() as u64)
    }

    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<(), LogError> {
        metrics::counter!("relay_dlq_published_total").increment(1);
        self.dead_letters
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeadLetterSource;
    use relay_core::{
        ConversationId, CorrelationId, EnvelopeMetadata, MessageId, MessageType, Priority, UserId,
    };
    use time::OffsetDateTime;

    fn envelope(content: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_id: MessageId::generate(),
            conversation_id: ConversationId::from("c-1"),
            sender_id: UserId::from("u-1"),
            created_at: OffsetDateTime::now_utc(),
            payload_key: None,
            idempotency_key: format!("idem_{content}"),
            correlation_id: CorrelationId::generate(),
            metadata: EnvelopeMetadata {
                content: Some(content.into()),
                content_type: MessageType::Text,
                priority: Priority::Normal,
                retry_count: 0,
                recipient_ids: vec![UserId::from("u-2")],
                client: None,
                flags: None,
                attachments: Vec::new(),
                media_url: None,
            },
        }
    }

    #[tokio::test]
    async fn append_assigns_monotone_ids() {
        let log = MemoryLog::new(2, Duration::from_secs(30));
        let a = log.append(0, &envelope("a")).await.unwrap();
        let b = log.append(0, &envelope("b")).await.unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn read_batch_is_fifo_and_leases() {
        let log = MemoryLog::new(1, Duration::from_secs(30));
        log.append(0, &envelope("a")).await.unwrap();
        log.append(0, &envelope("b")).await.unwrap();
        log.append(0, &envelope("c")).await.unwrap();

        let batch = log.read_batch(0, 2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].envelope.metadata.content.as_deref(), Some("a"));
        assert_eq!(batch[1].envelope.metadata.content.as_deref(), Some("b"));
        assert_eq!(log.pending(0).await.unwrap(), 2);

        // Leased entries are not redelivered while the lease is live.
        let next = log.read_batch(0, 10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].envelope.metadata.content.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn ack_removes_from_pending() {
        let log = MemoryLog::new(1, Duration::from_secs(30));
        log.append(0, &envelope("a")).await.unwrap();
        let batch = log.read_batch(0, 10, Duration::from_millis(10)).await.unwrap();
        log.ack(0, &[batch[0].id]).await.unwrap();
        assert_eq!(log.pending(0).await.unwrap(), 0);
        assert!(
            log.read_batch(0, 10, Duration::from_millis(10))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn unacked_entries_are_redelivered_in_order() {
        let log = MemoryLog::new(1, Duration::from_millis(20));
        log.append(0, &envelope("a")).await.unwrap();
        log.append(0, &envelope("b")).await.unwrap();

        let first = log.read_batch(0, 10, Duration::from_millis(5)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].delivery_count, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = log.read_batch(0, 10, Duration::from_millis(5)).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].envelope.metadata.content.as_deref(), Some("a"));
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let log = std::sync::Arc::new(MemoryLog::new(1, Duration::from_secs(30)));
        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.read_batch(0, 10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        log.append(0, &envelope("a")).await.unwrap();
        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let log = MemoryLog::new(2, Duration::from_secs(30));
        log.append(0, &envelope("a")).await.unwrap();
        assert!(
            log.read_batch(1, 10, Duration::from_millis(5))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn dead_letters_are_retained() {
        let log = MemoryLog::new(1, Duration::from_secs(30));
        let record = DeadLetterRecord::new(
            "max_retries_exceeded",
            "boom",
            3,
            DeadLetterSource {
                stream: "relay-messages".into(),
                id: 1,
            },
            envelope("a"),
        );
        log.dead_letter(record).await.unwrap();
        assert_eq!(log.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn unknown_partition_is_an_error() {
        let log = MemoryLog::new(1, Duration::from_secs(30));
        assert!(log.append(9, &envelope("a")).await.is_err());
    }
}
