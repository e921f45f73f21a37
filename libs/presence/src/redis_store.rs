use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use redis::AsyncCommands;
use relay_core::{SocketId, UserId};
use time::OffsetDateTime;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::{
    PresenceError, PresenceEvent, PresenceRegistry, PresenceSnapshot, SessionBinding,
    record_heartbeat, record_write,
};

/// Redis-backed presence registry shared by every instance of a deployment.
///
/// One hash per user (`<prefix>:presence:<user>`, field = socket id, value =
/// serialized binding) with a TTL on the whole key; heartbeats re-arm it.
/// Expiry of remotely-held keys is observed by sweeping the set of users this
/// instance has registered.
pub struct RedisPresence {
    namespace: String,
    ttl: Duration,
    connection: Mutex<redis::aio::ConnectionManager>,
    /// Users this instance registered; the sweep checks these for expiry.
    tracked: DashSet<UserId>,
    events: broadcast::Sender<PresenceEvent>,
}

impl RedisPresence {
    pub async fn connect(
        url: &str,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, PresenceError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let connection = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(store_err)?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            namespace: namespace.into(),
            ttl,
            connection: Mutex::new(connection),
            tracked: DashSet::new(),
            events,
        })
    }

    fn presence_key(&self, user: &UserId) -> String {
        format!("{}:presence:{}", self.namespace, user)
    }

    fn last_seen_key(&self, user: &UserId) -> String {
        format!("{}:lastseen:{}", self.namespace, user)
    }

    /// Emits offline transitions for tracked users whose presence key has
    /// expired. Returns how many transitions were emitted.
    pub async fn sweep_once(&self) -> Result<usize, PresenceError> {
        let users: Vec<UserId> = self.tracked.iter().map(|u| u.clone()).collect();
        let mut transitions = 0;
        for user in users {
            let key = self.presence_key(&user);
            let exists: bool = {
                let mut conn = self.connection.lock().await;
                conn.exists(&key).await.map_err(store_err)?
            };
            if !exists {
                self.tracked.remove(&user);
                self.record_offline(&user).await?;
                transitions += 1;
            }
        }
        if transitions > 0 {
            debug!(transitions, "presence sweep observed expirations");
        }
        Ok(transitions)
    }

    async fn record_offline(&self, user: &UserId) -> Result<(), PresenceError> {
        let now = relay_core::rfc3339(OffsetDateTime::now_utc());
        let mut conn = self.connection.lock().await;
        let _: () = conn
            .set(self.last_seen_key(user), now)
            .await
            .map_err(store_err)?;
        drop(conn);
        let _ = self.events.send(PresenceEvent::Offline(user.clone()));
        Ok(())
    }

    async fn bindings(&self, user: &UserId) -> Result<Vec<SessionBinding>, PresenceError> {
        let mut conn = self.connection.lock().await;
        let raw: Vec<(String, String)> = conn
            .hgetall(self.presence_key(user))
            .await
            .map_err(store_err)?;
        Ok(raw
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_str(&value).ok())
            .collect())
    }
}

fn store_err(err: impl std::fmt::Display) -> PresenceError {
    PresenceError::StoreUnavailable(err.to_string())
}

#[async_trait]
impl PresenceRegistry for RedisPresence {
    async fn register_connection(
        &self,
        user: &UserId,
        binding: SessionBinding,
    ) -> Result<(), PresenceError> {
        let key = self.presence_key(user);
        let payload = serde_json::to_string(&binding).map_err(store_err)?;
        let was_online: bool = {
            let mut conn = self.connection.lock().await;
            let existed: bool = conn.exists(&key).await.map_err(store_err)?;
            let _: () = redis::pipe()
                .hset(&key, binding.socket_id.as_str(), payload)
                .ignore()
                .pexpire(&key, self.ttl.as_millis() as i64)
                .ignore()
                .query_async(&mut *conn)
                .await
                .map_err(store_err)?;
            existed
        };
        self.tracked.insert(user.clone());
        record_write("connect");
        if !was_online {
            let _ = self.events.send(PresenceEvent::Online(user.clone()));
        }
        Ok(())
    }

    async fn extend_heartbeat(
        &self,
        user: &UserId,
        socket: &SocketId,
    ) -> Result<(), PresenceError> {
        let key = self.presence_key(user);
        let result: Result<bool, PresenceError> = async {
            let mut conn = self.connection.lock().await;
            let raw: Option<String> = conn.hget(&key, socket.as_str()).await.map_err(store_err)?;
            let Some(raw) = raw else { return Ok(false) };
            let mut binding: SessionBinding = serde_json::from_str(&raw).map_err(store_err)?;
            binding.last_heartbeat_at = OffsetDateTime::now_utc();
            let payload = serde_json::to_string(&binding).map_err(store_err)?;
            let _: () = redis::pipe()
                .hset(&key, socket.as_str(), payload)
                .ignore()
                .pexpire(&key, self.ttl.as_millis() as i64)
                .ignore()
                .query_async(&mut *conn)
                .await
                .map_err(store_err)?;
            Ok(true)
        }
        .await;
        match result {
            Ok(true) => {
                record_heartbeat("success");
                Ok(())
            }
            Ok(false) => {
                record_heartbeat("error");
                Ok(())
            }
            Err(err) => {
                record_heartbeat("error");
                Err(err)
            }
        }
    }

    async fn unregister(&self, user: &UserId, socket: &SocketId) -> Result<(), PresenceError> {
        let key = self.presence_key(user);
        let remaining: i64 = {
            let mut conn = self.connection.lock().await;
            let _: () = conn.hdel(&key, socket.as_str()).await.map_err(store_err)?;
            conn.hlen(&key).await.map_err(store_err)?
        };
        record_write("disconnect");
        if remaining == 0 {
            self.tracked.remove(user);
            self.record_offline(user).await?;
        }
        Ok(())
    }

    async fn who_is(&self, user: &UserId) -> Result<PresenceSnapshot, PresenceError> {
        let sockets = self.bindings(user).await?;
        Ok(PresenceSnapshot {
            is_online: !sockets.is_empty(),
            sockets,
        })
    }

    async fn sockets_of(&self, user: &UserId) -> Result<Vec<SessionBinding>, PresenceError> {
        self.bindings(user).await
    }

    async fn is_online(&self, user: &UserId) -> Result<bool, PresenceError> {
        let mut conn = self.connection.lock().await;
        let exists: bool = conn
            .exists(self.presence_key(user))
            .await
            .map_err(store_err)?;
        Ok(exists)
    }

    async fn last_seen(&self, user: &UserId) -> Result<Option<OffsetDateTime>, PresenceError> {
        let raw: Option<String> = {
            let mut conn = self.connection.lock().await;
            conn.get(self.last_seen_key(user)).await.map_err(store_err)?
        };
        Ok(raw.and_then(|value| {
            OffsetDateTime::parse(&value, &time::format_description::well_known::Rfc3339).ok()
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}
