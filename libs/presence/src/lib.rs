//! Presence registry: the authoritative record of which sockets each user
//! has live and on which instance.
//!
//! Bindings are TTL-backed; heartbeats extend them, and expiry is observed by
//! a periodic sweep so offline transitions are eventually emitted even when a
//! client vanishes without disconnecting.

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{SocketId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub use memory::MemoryPresence;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisPresence;

pub type SharedPresence = Arc<dyn PresenceRegistry>;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence store unavailable: {0}")]
    StoreUnavailable(String),
}

/// One live (user, socket) pair on one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionBinding {
    pub socket_id: SocketId,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat_at: OffsetDateTime,
}

impl SessionBinding {
    pub fn new(socket_id: SocketId, instance_id: impl Into<String>, agent: Option<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            socket_id,
            instance_id: instance_id.into(),
            agent,
            connected_at: now,
            last_heartbeat_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PresenceSnapshot {
    pub is_online: bool,
    pub sockets: Vec<SessionBinding>,
}

/// Online/offline edge transitions, emitted when a user's binding set
/// becomes non-empty or empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Online(UserId),
    Offline(UserId),
}

#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Adds the binding and (re)sets its TTL. A repeat call for the same
    /// socket replaces the binding rather than duplicating it.
    async fn register_connection(
        &self,
        user: &UserId,
        binding: SessionBinding,
    ) -> Result<(), PresenceError>;

    /// Updates `last_heartbeat_at` and refreshes the TTL.
    async fn extend_heartbeat(&self, user: &UserId, socket: &SocketId)
    -> Result<(), PresenceError>;

    /// Removes the binding; the user's `last_seen` is recorded when the
    /// remaining set is empty.
    async fn unregister(&self, user: &UserId, socket: &SocketId) -> Result<(), PresenceError>;

    async fn who_is(&self, user: &UserId) -> Result<PresenceSnapshot, PresenceError>;

    async fn sockets_of(&self, user: &UserId) -> Result<Vec<SessionBinding>, PresenceError>;

    async fn is_online(&self, user: &UserId) -> Result<bool, PresenceError>;

    async fn last_seen(&self, user: &UserId) -> Result<Option<OffsetDateTime>, PresenceError>;

    /// Online/offline transition feed.
    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PresenceEvent>;
}

pub(crate) fn record_write(event: &'static str) {
    metrics::counter!("relay_presence_writes_total", "event" => event).increment(1);
}

pub(crate) fn record_heartbeat(result: &'static str) {
    metrics::counter!("relay_presence_heartbeat_total", "result" => result).increment(1);
}
