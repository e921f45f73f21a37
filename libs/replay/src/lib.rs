//! Replay cache: a bounded, TTL-limited ring of recent messages per
//! conversation, used to recover events missed across a transient disconnect.
//!
//! This is a soft cache. Losing it (or asking with a cursor it no longer
//! holds) yields an empty replay and the client falls back to paginated
//! history; correctness never depends on its contents.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relay_core::{ConversationId, MessageEnvelope, MessageId};

#[derive(Debug, Clone)]
pub struct ReplayCacheConfig {
    pub ttl: Duration,
    pub max_messages: usize,
}

impl Default for ReplayCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_messages: 500,
        }
    }
}

struct Entry {
    message_id: MessageId,
    envelope: MessageEnvelope,
    arrived_at: Instant,
}

pub struct ReplayCache {
    config: ReplayCacheConfig,
    rings: DashMap<ConversationId, VecDeque<Entry>>,
}

impl ReplayCache {
    pub fn new(config: ReplayCacheConfig) -> Self {
        Self {
            config,
            rings: DashMap::new(),
        }
    }

    /// Appends an envelope to the conversation's ring, evicting by age and
    /// count. Called alongside successful persistence.
    pub fn record(&self, envelope: MessageEnvelope) {
        let mut ring = self
            .rings
            .entry(envelope.conversation_id.clone())
            .or_default();
        ring.push_back(Entry {
            message_id: envelope.message_id,
            arrived_at: Instant::now(),
            envelope,
        });
        while ring.len() > self.config.max_messages {
            ring.pop_front();
        }
        Self::prune_expired(&mut ring, self.config.ttl);
    }

    /// Ordered envelopes strictly after `cursor`. A missing cursor, or one
    /// that already fell out of the ring, returns empty.
    pub fn fetch_since(
        &self,
        conversation: &ConversationId,
        cursor: Option<MessageId>,
    ) -> Vec<MessageEnvelope> {
        let Some(cursor) = cursor else {
            metrics::counter!("relay_replay_cache_total", "result" => "miss").increment(1);
            return Vec::new();
        };
        let Some(mut ring) = self.rings.get_mut(conversation) else {
            metrics::counter!("relay_replay_cache_total", "result" => "miss").increment(1);
            return Vec::new();
        };
        Self::prune_expired(&mut ring, self.config.ttl);
        let Some(position) = ring.iter().position(|entry| entry.message_id == cursor) else {
            metrics::counter!("relay_replay_cache_total", "result" => "miss").increment(1);
            return Vec::new();
        };
        metrics::counter!("relay_replay_cache_total", "result" => "hit").increment(1);
        ring.iter()
            .skip(position + 1)
            .map(|entry| entry.envelope.clone())
            .collect()
    }

    /// Number of buffered envelopes for a conversation (post-expiry).
    pub fn len(&self, conversation: &ConversationId) -> usize {
        self.rings
            .get_mut(conversation)
            .map(|mut ring| {
                Self::prune_expired(&mut ring, self.config.ttl);
                ring.len()
            })
            .unwrap_or(0)
    }

    fn prune_expired(ring: &mut VecDeque<Entry>, ttl: Duration) {
        let now = Instant::now();
        while ring
            .front()
            .is_some_and(|entry| now.duration_since(entry.arrived_at) > ttl)
        {
            ring.pop_front();
        }
    }
}
