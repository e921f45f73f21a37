//! Ingress deduplication primitives.
//!
//! The idempotency key is the contract that makes retries safe end-to-end:
//! presenting the same key twice must never produce a second persisted
//! message. Keys are derived here; the authoritative uniqueness check is the
//! message store's unique index, with a short-TTL ack cache in front of it to
//! absorb rapid retries without a round trip.

mod ack_cache;
mod key;

pub use ack_cache::AckCache;
pub use key::{client_key, content_key, derive_key};

use relay_core::{CorrelationId, MessageId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Producer acknowledgement returned to the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressAck {
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub state: AckState,
    #[serde(with = "time::serde::rfc3339")]
    pub accepted_at: OffsetDateTime,
    pub idempotency_key: String,
    pub idempotent_hit: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckState {
    /// Enqueued to the log; persistence will follow.
    Pending,
    /// The key matched an already-persisted message.
    Persisted,
}

impl IngressAck {
    pub fn pending(
        message_id: MessageId,
        correlation_id: CorrelationId,
        idempotency_key: String,
    ) -> Self {
        Self {
            message_id,
            correlation_id,
            state: AckState::Pending,
            accepted_at: OffsetDateTime::now_utc(),
            idempotency_key,
            idempotent_hit: false,
        }
    }

    /// The same ack, marked as a duplicate hit for the retry caller.
    pub fn as_hit(&self) -> Self {
        Self {
            idempotent_hit: true,
            ..self.clone()
        }
    }
}

pub fn record_hit(source: &'static str) {
    metrics::counter!("relay_idempotent_hits_total", "source" => source).increment(1);
}
