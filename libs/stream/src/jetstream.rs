use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use async_nats::Client;
use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, DeliverPolicy, PullConsumer, pull::Config as PullConfig},
    stream::{Config as StreamConfig, RetentionPolicy},
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use nanoid::nanoid;
use relay_core::{MessageEnvelope, dlq_subject, partition_subject};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{DeadLetterRecord, EntryId, LogError, PartitionedLog, PendingEntry};

const MESSAGE_STREAM: &str = "relay-messages";
const DLQ_STREAM: &str = "relay-dlq";
const CONSUMER_GROUP: &str = "persistence-workers";

/// JetStream-backed durable log. One stream holds every partition as its own
/// subject; each partition gets one durable explicit-ack pull consumer, so
/// pending bookkeeping and redelivery come from the server.
pub struct JetStreamLog {
    js: jetstream::Context,
    prefix: String,
    /// Worker identity used in logs; unique per process.
    consumer_label: String,
    consumers: Mutex<HashMap<u32, PullConsumer>>,
    /// Delivered-but-unacked messages, so `ack` can work by entry id.
    inflight: DashMap<(u32, u64), jetstream::Message>,
}

impl JetStreamLog {
    pub async fn connect(client: Client, prefix: &str, partitions: u32) -> anyhow::Result<Self> {
        let js = jetstream::new(client);

        js.get_or_create_stream(StreamConfig {
            name: MESSAGE_STREAM.into(),
            subjects: vec![format!("{prefix}.messages.*")],
            retention: RetentionPolicy::WorkQueue,
            max_messages: -1,
            max_messages_per_subject: -1,
            max_bytes: -1,
            ..Default::default()
        })
        .await
        .with_context(|| format!("ensure stream {MESSAGE_STREAM}"))?;

        js.get_or_create_stream(StreamConfig {
            name: DLQ_STREAM.into(),
            subjects: vec![dlq_subject(prefix)],
            retention: RetentionPolicy::Limits,
            max_messages: -1,
            max_bytes: -1,
            description: Some("Relay dead-letter sink".into()),
            ..Default::default()
        })
        .await
        .with_context(|| format!("ensure stream {DLQ_STREAM}"))?;

        let consumer_label = format!(
            "consumer-{}-{}",
            std::process::id(),
            time::OffsetDateTime::now_utc().unix_timestamp()
        );
        info!(%consumer_label, partitions, "jetstream log ready");

        Ok(Self {
            js,
            prefix: prefix.to_string(),
            consumer_label,
            consumers: Mutex::new(HashMap::new()),
            inflight: DashMap::new(),
        })
    }

    async fn consumer(&self, partition: u32) -> Result<PullConsumer, LogError> {
        let mut guard = self.consumers.lock().await;
        if let Some(consumer) = guard.get(&partition) {
            return Ok(consumer.clone());
        }
        let stream = self
            .js
            .get_stream(MESSAGE_STREAM)
            .await
            .map_err(|err| LogError::Read(err.to_string()))?;
        let name = format!("{CONSUMER_GROUP}-{partition}");
        let consumer = stream
            .get_or_create_consumer(
                &name,
                PullConfig {
                    durable_name: Some(name.clone()),
                    filter_subject: partition_subject(&self.prefix, partition),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: 1024,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| LogError::Read(err.to_string()))?;
        guard.insert(partition, consumer.clone());
        Ok(consumer)
    }
}

#[async_trait]
impl PartitionedLog for JetStreamLog {
    async fn append(
        &self,
        partition: u32,
        envelope: &MessageEnvelope,
    ) -> Result<EntryId, LogError> {
        let subject = partition_subject(&self.prefix, partition);
        let payload =
            serde_json::to_vec(envelope).map_err(|err| LogError::Append(err.to_string()))?;
        let ack = self
            .js
            .publish(subject, payload.into())
            .await
            .map_err(|err| LogError::Append(err.to_string()))?
            .await
            .map_err(|err| LogError::Append(err.to_string()))?;
        metrics::counter!("relay_log_appends_total").increment(1);
        Ok(EntryId(ack.sequence))
    }

    async fn read_batch(
        &self,
        partition: u32,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<PendingEntry>, LogError> {
        let consumer = self.consumer(partition).await?;
        let mut messages = consumer
            .fetch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|err| LogError::Read(err.to_string()))?;

        let mut batch = Vec::new();
        while let Some(message) = messages
            .try_next()
            .await
            .map_err(|err| LogError::Read(err.to_string()))?
        {
            let info = message
                .info()
                .map_err(|err| LogError::Read(err.to_string()))?;
            let sequence = info.stream_sequence;
            let delivery_count = info.delivered.max(1) as u32;
            match serde_json::from_slice::<MessageEnvelope>(&message.payload) {
                Ok(envelope) => {
                    batch.push(PendingEntry {
                        id: EntryId(sequence),
                        envelope,
                        delivery_count,
                    });
                    self.inflight.insert((partition, sequence), message);
                }
                Err(err) => {
                    // A payload that cannot be parsed will never succeed;
                    // terminate it rather than letting it cycle forever.
                    warn!(sequence, error = %err, "dropping unparseable log entry");
                    let _ = message.ack_with(AckKind::Term).await;
                }
            }
        }
        Ok(batch)
    }

    async fn ack(&self, partition: u32, ids: &[EntryId]) -> Result<(), LogError> {
        for id in ids {
            let Some((_, message)) = self.inflight.remove(&(partition, id.0)) else {
                continue;
            };
            message
                .ack()
                .await
                .map_err(|err| LogError::Ack(err.to_string()))?;
        }
        Ok(())
    }

    async fn pending(&self, partition: u32) -> Result<u64, LogError> {
        let mut guard = self.consumers.lock().await;
        let Some(consumer) = guard.get_mut(&partition) else {
            return Ok(0);
        };
        let info = consumer
            .info()
            .await
            .map_err(|err| LogError::Read(err.to_string()))?;
        Ok(info.num_ack_pending as u64)
    }

    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<(), LogError> {
        let subject = dlq_subject(&self.prefix);
        let payload =
            serde_json::to_vec(&record).map_err(|err| LogError::DeadLetter(err.to_string()))?;
        self.js
            .publish(subject, payload.into())
            .await
            .map_err(|err| LogError::DeadLetter(err.to_string()))?
            .await
            .map_err(|err| LogError::DeadLetter(err.to_string()))?;
        metrics::counter!("relay_dlq_published_total").increment(1);
        info!(
            consumer = %self.consumer_label,
            message_id = %record.envelope.message_id,
            conversation_id = %record.envelope.conversation_id,
            reason = %record.reason,
            retry_count = record.retry_count,
            "dead-letter entry published"
        );
        Ok(())
    }
}

/// Reads up to `limit` dead-letter records for operational inspection.
pub async fn list_dead_letters(
    client: Client,
    limit: usize,
) -> anyhow::Result<Vec<DeadLetterRecord>> {
    let js = jetstream::new(client);
    let stream = js.get_stream(DLQ_STREAM).await?;
    let durable = format!("dlq-list-{}", nanoid!(6));
    let consumer = stream
        .create_consumer(PullConfig {
            durable_name: Some(durable),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::None,
            ..Default::default()
        })
        .await?;
    let mut messages = consumer.fetch().max_messages(limit).messages().await?;
    let mut out = Vec::new();
    while let Some(message) = messages.try_next().await.map_err(|e| anyhow::anyhow!(e))? {
        match serde_json::from_slice::<DeadLetterRecord>(&message.payload) {
            Ok(record) => out.push(record),
            Err(err) => warn!(error = %err, "skipping unparseable dead-letter record"),
        }
    }
    Ok(out)
}
