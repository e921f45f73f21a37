use relay_core::{MessageEnvelope, partition_for};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{EntryId, LogError, PartitionedLog};

/// Where a dead-lettered entry originally lived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterSource {
    pub stream: String,
    pub id: u64,
}

/// Payload stored for each dead-lettered envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub reason: String,
    pub error: String,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub dead_lettered_at: OffsetDateTime,
    pub source: DeadLetterSource,
    pub envelope: MessageEnvelope,
}

impl DeadLetterRecord {
    pub fn new(
        reason: impl Into<String>,
        error: impl Into<String>,
        retry_count: u32,
        source: DeadLetterSource,
        envelope: MessageEnvelope,
    ) -> Self {
        Self {
            reason: reason.into(),
            error: error.into(),
            retry_count,
            dead_lettered_at: OffsetDateTime::now_utc(),
            source,
            envelope,
        }
    }
}

/// Re-appends a dead-lettered envelope to its conversation's partition with
/// the retry count reset.
pub async fn replay_dead_letter(
    log: &dyn PartitionedLog,
    partitions: u32,
    record: &DeadLetterRecord,
) -> Result<EntryId, LogError> {
    let envelope = record.envelope.clone().with_retry_count(0);
    let partition = partition_for(&envelope.conversation_id, partitions);
    log.append(partition, &envelope).await
}
