use std::sync::Arc;
use std::time::Instant;

use relay_core::{
    ClientMeta, ConversationId, CorrelationId, EnvelopeMetadata, MessageEnvelope, MessageFlags,
    MessageId, MessageType, UserId, partition_for,
};
use relay_dal::SharedDatastore;
use relay_idempotency::{AckCache, AckState, IngressAck, derive_key, record_hit};
use relay_stream::SharedLog;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::error::ProducerError;
use crate::rate::SenderRateLimiter;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub message_type: MessageType,
    pub attachments: Vec<Value>,
    pub media_url: Option<String>,
    pub client_message_id: Option<String>,
    pub client: Option<ClientMeta>,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to_id: Option<MessageId>,
    pub thread_id: Option<String>,
}

impl SendRequest {
    pub fn text(conversation: &str, sender: &str, content: &str) -> Self {
        Self {
            conversation_id: ConversationId::from(conversation),
            sender_id: UserId::from(sender),
            content: Some(content.to_string()),
            message_type: MessageType::Text,
            attachments: Vec::new(),
            media_url: None,
            client_message_id: None,
            client: None,
            correlation_id: None,
            reply_to_id: None,
            thread_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub partitions: u32,
    pub max_content_bytes: usize,
    /// Per-partition pending high-water mark; exceeding it throttles instead
    /// of queueing without bound.
    pub pending_high_water: Option<u64>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            partitions: 16,
            max_content_bytes: 10_000,
            pending_high_water: None,
        }
    }
}

/// The ingress fast path: validate, authorize, deduplicate, enqueue, ack.
pub struct Producer {
    store: SharedDatastore,
    log: SharedLog,
    ack_cache: AckCache,
    limiter: Option<SenderRateLimiter>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(
        store: SharedDatastore,
        log: SharedLog,
        ack_cache: AckCache,
        limiter: Option<SenderRateLimiter>,
        config: ProducerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            log,
            ack_cache,
            limiter,
            config,
        })
    }

    #[instrument(
        name = "producer.send",
        skip_all,
        fields(
            conversation_id = %request.conversation_id,
            sender_id = %request.sender_id
        )
    )]
    pub async fn send(&self, request: SendRequest) -> Result<IngressAck, ProducerError> {
        let started = Instant::now();
        self.validate(&request)?;
        self.authorize(&request).await?;

        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire(&request.sender_id) {
                metrics::counter!("relay_producer_throttled_total", "reason" => "rate")
                    .increment(1);
                return Err(ProducerError::EnqueueThrottled);
            }
        }

        let now = OffsetDateTime::now_utc();
        let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
        let content = request.content.clone().unwrap_or_default();
        let idempotency_key = derive_key(
            request.client_message_id.as_deref(),
            &request.conversation_id,
            &request.sender_id,
            &content,
            now_ms,
        );

        if let Some(ack) = self.ack_cache.get(&idempotency_key) {
            record_hit("cache");
            return Ok(ack.as_hit());
        }
        if let Some(existing) = self.store.find_by_idempotency_key(&idempotency_key).await? {
            record_hit("store");
            let ack = IngressAck {
                message_id: existing,
                correlation_id: request
                    .correlation_id
                    .clone()
                    .unwrap_or_else(CorrelationId::generate),
                state: AckState::Persisted,
                accepted_at: now,
                idempotency_key,
                idempotent_hit: true,
            };
            self.ack_cache.put(ack.clone());
            return Ok(ack.as_hit());
        }

        let envelope = self.build_envelope(&request, idempotency_key, now).await?;
        let partition = partition_for(&envelope.conversation_id, self.config.partitions);

        if let Some(high_water) = self.config.pending_high_water {
            let pending = self
                .log
                .pending(partition)
                .await
                .map_err(|err| ProducerError::EnqueueFailed(err.to_string()))?;
            if pending >= high_water {
                metrics::counter!("relay_producer_throttled_total", "reason" => "backlog")
                    .increment(1);
                return Err(ProducerError::EnqueueThrottled);
            }
        }

        self.log
            .append(partition, &envelope)
            .await
            .map_err(|err| ProducerError::EnqueueFailed(err.to_string()))?;

        let ack = IngressAck::pending(
            envelope.message_id,
            envelope.correlation_id.clone(),
            envelope.idempotency_key.clone(),
        );
        self.ack_cache.put(ack.clone());
        metrics::histogram!("relay_producer_seconds").record(started.elapsed().as_secs_f64());
        debug!(partition, message_id = %ack.message_id, "envelope enqueued");
        Ok(ack)
    }

    fn validate(&self, request: &SendRequest) -> Result<(), ProducerError> {
        let content = request.content.as_deref().unwrap_or("");
        if content.trim().is_empty()
            && request.attachments.is_empty()
            && request.media_url.is_none()
        {
            return Err(ProducerError::InvalidSchema(
                "content is required when there are no attachments".into(),
            ));
        }
        if content.len() > self.config.max_content_bytes {
            return Err(ProducerError::PayloadTooLarge {
                size: content.len(),
                max: self.config.max_content_bytes,
            });
        }
        Ok(())
    }

    async fn authorize(&self, request: &SendRequest) -> Result<(), ProducerError> {
        let conversation = self
            .store
            .conversation(&request.conversation_id)
            .await?
            .ok_or(ProducerError::ConversationNotFound)?;
        if !conversation.is_active {
            return Err(ProducerError::ConversationInactive);
        }
        let member = self
            .store
            .member(&request.conversation_id, &request.sender_id)
            .await?;
        if !member.is_some_and(|m| m.is_active) {
            return Err(ProducerError::NotMember);
        }
        if self
            .store
            .is_user_blocked(&request.conversation_id, &request.sender_id)
            .await?
        {
            return Err(ProducerError::UserBlocked);
        }
        Ok(())
    }

    async fn build_envelope(
        &self,
        request: &SendRequest,
        idempotency_key: String,
        now: OffsetDateTime,
    ) -> Result<MessageEnvelope, ProducerError> {
        let recipients: Vec<UserId> = self
            .store
            .members(&request.conversation_id)
            .await?
            .into_iter()
            .filter(|m| m.is_active && m.user_id != request.sender_id)
            .map(|m| m.user_id)
            .collect();
        let flags = MessageFlags {
            requires_receipt: true,
            reply_to_id: request.reply_to_id,
            thread_id: request.thread_id.clone(),
            ..Default::default()
        };
        Ok(MessageEnvelope {
            message_id: MessageId::generate(),
            conversation_id: request.conversation_id.clone(),
            sender_id: request.sender_id.clone(),
            created_at: now,
            payload_key: None,
            idempotency_key,
            correlation_id: request
                .correlation_id
                .clone()
                .unwrap_or_else(CorrelationId::generate),
            metadata: EnvelopeMetadata {
                content: request.content.clone(),
                content_type: request.message_type,
                priority: Default::default(),
                retry_count: 0,
                recipient_ids: recipients,
                client: request.client.clone(),
                flags: Some(flags),
                attachments: request.attachments.clone(),
                media_url: request.media_url.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProducerError;
    use crate::rate::{RateLimit, SenderRateLimiter};
    use relay_core::{Conversation, ConversationKind, ConversationMember, MemberRole};
    use relay_dal::{ConversationStore, MemoryDatastore};
    use relay_stream::{MemoryLog, PartitionedLog};
    use std::time::Duration;

    const PARTITIONS: u32 = 4;

    async fn seeded_store(active: bool) -> Arc<MemoryDatastore> {
        let store = Arc::new(MemoryDatastore::new());
        store.add_user(UserId::from("u-1"));
        store.add_user(UserId::from("u-2"));
        store
            .create_conversation(
                Conversation {
                    id: ConversationId::from("c-1"),
                    kind: ConversationKind::Direct,
                    title: None,
                    description: None,
                    is_active: active,
                    created_at: OffsetDateTime::now_utc(),
                    last_message_id: None,
                    last_message_at: None,
                },
                vec![
                    ConversationMember {
                        conversation_id: ConversationId::from("c-1"),
                        user_id: UserId::from("u-1"),
                        role: MemberRole::Owner,
                        is_active: true,
                        joined_at: OffsetDateTime::now_utc(),
                    },
                    ConversationMember {
                        conversation_id: ConversationId::from("c-1"),
                        user_id: UserId::from("u-2"),
                        role: MemberRole::Member,
                        is_active: true,
                        joined_at: OffsetDateTime::now_utc(),
                    },
                ],
            )
            .await
            .unwrap();
        store
    }

    fn build(
        store: Arc<MemoryDatastore>,
        log: Arc<MemoryLog>,
        config: ProducerConfig,
        limiter: Option<SenderRateLimiter>,
    ) -> Arc<Producer> {
        Producer::new(
            store,
            log,
            relay_idempotency::AckCache::new(Duration::from_secs(60)),
            limiter,
            config,
        )
    }

    fn default_producer(store: Arc<MemoryDatastore>, log: Arc<MemoryLog>) -> Arc<Producer> {
        build(
            store,
            log,
            ProducerConfig {
                partitions: PARTITIONS,
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn unknown_conversation_is_rejected() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log);
        let err = producer
            .send(SendRequest::text("c-missing", "u-1", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conversation_not_found");
    }

    #[tokio::test]
    async fn inactive_conversation_is_rejected() {
        let store = seeded_store(false).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log);
        let err = producer
            .send(SendRequest::text("c-1", "u-1", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conversation_inactive");
    }

    #[tokio::test]
    async fn non_member_is_rejected() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log);
        let err = producer
            .send(SendRequest::text("c-1", "u-9", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_member");
    }

    #[tokio::test]
    async fn blocked_sender_is_rejected() {
        let store = seeded_store(true).await;
        store.block_user(ConversationId::from("c-1"), UserId::from("u-1"));
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log);
        let err = producer
            .send(SendRequest::text("c-1", "u-1", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "user_blocked");
    }

    #[tokio::test]
    async fn empty_content_without_attachments_is_rejected() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log);
        let err = producer
            .send(SendRequest::text("c-1", "u-1", "   "))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_schema");
    }

    #[tokio::test]
    async fn media_only_message_is_accepted() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log);
        let mut request = SendRequest::text("c-1", "u-1", "");
        request.message_type = MessageType::Image;
        request.media_url = Some("https://cdn.example/img.png".into());
        assert!(producer.send(request).await.is_ok());
    }

    #[tokio::test]
    async fn content_at_the_limit_is_accepted_one_more_byte_is_not() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log);

        let at_limit = "a".repeat(10_000);
        assert!(
            producer
                .send(SendRequest::text("c-1", "u-1", &at_limit))
                .await
                .is_ok()
        );

        let over = "a".repeat(10_001);
        let err = producer
            .send(SendRequest::text("c-1", "u-1", &over))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "payload_too_large");
        assert!(err.to_string().contains("too long"));
    }

    #[tokio::test]
    async fn backlog_over_high_water_throttles() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = build(
            store,
            log.clone(),
            ProducerConfig {
                partitions: PARTITIONS,
                max_content_bytes: 10_000,
                pending_high_water: Some(1),
            },
            None,
        );

        producer
            .send(SendRequest::text("c-1", "u-1", "first"))
            .await
            .unwrap();
        // Lease the entry so it counts as pending, then send again.
        let partition = partition_for(&ConversationId::from("c-1"), PARTITIONS);
        let _ = log
            .read_batch(partition, 10, Duration::from_millis(10))
            .await
            .unwrap();
        let err = producer
            .send(SendRequest::text("c-1", "u-1", "second"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::EnqueueThrottled));
    }

    #[tokio::test]
    async fn rate_limiter_throttles_rapid_senders() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = build(
            store,
            log,
            ProducerConfig {
                partitions: PARTITIONS,
                ..Default::default()
            },
            Some(SenderRateLimiter::new(RateLimit {
                per_second: 0.001,
                burst: 1.0,
            })),
        );

        assert!(
            producer
                .send(SendRequest::text("c-1", "u-1", "one"))
                .await
                .is_ok()
        );
        let err = producer
            .send(SendRequest::text("c-1", "u-1", "two"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::EnqueueThrottled));
    }

    #[tokio::test]
    async fn envelope_routes_to_a_stable_partition() {
        let store = seeded_store(true).await;
        let log = Arc::new(MemoryLog::new(PARTITIONS, Duration::from_secs(30)));
        let producer = default_producer(store, log.clone());
        producer
            .send(SendRequest::text("c-1", "u-1", "one"))
            .await
            .unwrap();
        producer
            .send(SendRequest::text("c-1", "u-1", "two"))
            .await
            .unwrap();

        let partition = partition_for(&ConversationId::from("c-1"), PARTITIONS);
        let batch = log
            .read_batch(partition, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch[0].envelope.metadata.content.as_deref(),
            Some("one")
        );
    }
}
