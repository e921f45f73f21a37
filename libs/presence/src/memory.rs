use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{SocketId, UserId};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    PresenceError, PresenceEvent, PresenceRegistry, PresenceSnapshot, SessionBinding,
    record_heartbeat, record_write,
};

struct TimedBinding {
    binding: SessionBinding,
    expires_at: Instant,
}

/// In-process presence registry used in tests and single-node deployments.
pub struct MemoryPresence {
    ttl: Duration,
    bindings: DashMap<UserId, HashMap<SocketId, TimedBinding>>,
    last_seen: DashMap<UserId, OffsetDateTime>,
    events: broadcast::Sender<PresenceEvent>,
}

impl MemoryPresence {
    pub fn new(ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            ttl,
            bindings: DashMap::new(),
            last_seen: DashMap::new(),
            events,
        }
    }

    /// Drops expired bindings and emits offline transitions for users whose
    /// set became empty. Returns how many bindings were evicted.
    pub fn sweep_once(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        let mut went_offline = Vec::new();
        self.bindings.retain(|user, sockets| {
            let before = sockets.len();
            sockets.retain(|_, timed| timed.expires_at > now);
            evicted += before - sockets.len();
            if sockets.is_empty() && before > 0 {
                went_offline.push(user.clone());
            }
            !sockets.is_empty()
        });
        for user in went_offline {
            self.mark_offline(&user);
        }
        evicted
    }

    /// Runs [`Self::sweep_once`] on an interval until the registry is dropped.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = std::sync::Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        let evicted = registry.sweep_once();
                        if evicted > 0 {
                            debug!(evicted, "presence sweep evicted expired bindings");
                        }
                    }
                    None => break,
                }
            }
        })
    }

    fn mark_offline(&self, user: &UserId) {
        self.last_seen.insert(user.clone(), OffsetDateTime::now_utc());
        let _ = self.events.send(PresenceEvent::Offline(user.clone()));
    }

    fn live_bindings(&self, user: &UserId) -> Vec<SessionBinding> {
        let now = Instant::now();
        self.bindings
            .get(user)
            .map(|sockets| {
                sockets
                    .values()
                    .filter(|timed| timed.expires_at > now)
                    .map(|timed| timed.binding.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PresenceRegistry for MemoryPresence {
    async fn register_connection(
        &self,
        user: &UserId,
        binding: SessionBinding,
    ) -> Result<(), PresenceError> {
        let now = Instant::now();
        let mut entry = self.bindings.entry(user.clone()).or_default();
        let was_online = entry.values().any(|timed| timed.expires_at > now);
        entry.insert(
            binding.socket_id.clone(),
            TimedBinding {
                binding,
                expires_at: now + self.ttl,
            },
        );
        drop(entry);
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
        let extended = self
            .bindings
            .get_mut(user)
            .and_then(|mut sockets| {
                sockets.get_mut(socket).map(|timed| {
                    timed.binding.last_heartbeat_at = OffsetDateTime::now_utc();
                    timed.expires_at = Instant::now() + self.ttl;
                })
            })
            .is_some();
        record_heartbeat(if extended { "success" } else { "error" });
        Ok(())
    }

    async fn unregister(&self, user: &UserId, socket: &SocketId) -> Result<(), PresenceError> {
        let mut now_offline = false;
        if let Some(mut sockets) = self.bindings.get_mut(user) {
            if sockets.remove(socket).is_some() && sockets.is_empty() {
                now_offline = true;
            }
        }
        if now_offline {
            self.bindings.remove_if(user, |_, sockets| sockets.is_empty());
            self.mark_offline(user);
        }
        record_write("disconnect");
        Ok(())
    }

    async fn who_is(&self, user: &UserId) -> Result<PresenceSnapshot, PresenceError> {
        let sockets = self.live_bindings(user);
        Ok(PresenceSnapshot {
            is_online: !sockets.is_empty(),
            sockets,
        })
    }

    async fn sockets_of(&self, user: &UserId) -> Result<Vec<SessionBinding>, PresenceError> {
        Ok(self.live_bindings(user))
    }

    async fn is_online(&self, user: &UserId) -> Result<bool, PresenceError> {
        Ok(!self.live_bindings(user).is_empty())
    }

    async fn last_seen(&self, user: &UserId) -> Result<Option<OffsetDateTime>, PresenceError> {
        Ok(self.last_seen.get(user).map(|seen| *seen))
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(socket: &str) -> SessionBinding {
        SessionBinding::new(SocketId::from(socket), "inst-1", Some("test-agent".into()))
    }

    #[tokio::test]
    async fn double_register_keeps_one_binding() {
        let registry = MemoryPresence::new(Duration::from_secs(60));
        let user = UserId::from("u-1");
        registry
            .register_connection(&user, binding("s-1"))
            .await
            .unwrap();
        registry
            .register_connection(&user, binding("s-1"))
            .await
            .unwrap();
        assert_eq!(registry.sockets_of(&user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multiple_sockets_per_user() {
        let registry = MemoryPresence::new(Duration::from_secs(60));
        let user = UserId::from("u-1");
        registry
            .register_connection(&user, binding("s-1"))
            .await
            .unwrap();
        registry
            .register_connection(&user, binding("s-2"))
            .await
            .unwrap();
        let snapshot = registry.who_is(&user).await.unwrap();
        assert!(snapshot.is_online);
        assert_eq!(snapshot.sockets.len(), 2);

        registry
            .unregister(&user, &SocketId::from("s-1"))
            .await
            .unwrap();
        assert!(registry.is_online(&user).await.unwrap());
    }

    #[tokio::test]
    async fn online_and_offline_transitions_are_emitted() {
        let registry = MemoryPresence::new(Duration::from_secs(60));
        let mut events = registry.subscribe();
        let user = UserId::from("u-1");

        registry
            .register_connection(&user, binding("s-1"))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), PresenceEvent::Online(user.clone()));

        // A second socket is not a transition.
        registry
            .register_connection(&user, binding("s-2"))
            .await
            .unwrap();

        registry
            .unregister(&user, &SocketId::from("s-1"))
            .await
            .unwrap();
        registry
            .unregister(&user, &SocketId::from("s-2"))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), PresenceEvent::Offline(user.clone()));
        assert!(registry.last_seen(&user).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_bindings_are_swept_offline() {
        let registry = MemoryPresence::new(Duration::from_millis(10));
        let mut events = registry.subscribe();
        let user = UserId::from("u-1");
        registry
            .register_connection(&user, binding("s-1"))
            .await
            .unwrap();
        let _ = events.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(registry.sweep_once(), 1);
        assert!(!registry.is_online(&user).await.unwrap());
        assert_eq!(events.recv().await.unwrap(), PresenceEvent::Offline(user));
    }

    #[tokio::test]
    async fn heartbeat_extends_the_ttl() {
        let registry = MemoryPresence::new(Duration::from_millis(40));
        let user = UserId::from("u-1");
        registry
            .register_connection(&user, binding("s-1"))
            .await
            .unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            registry
                .extend_heartbeat(&user, &SocketId::from("s-1"))
                .await
                .unwrap();
        }
        registry.sweep_once();
        assert!(registry.is_online(&user).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_socket_is_not_fatal() {
        let registry = MemoryPresence::new(Duration::from_secs(60));
        let user = UserId::from("u-1");
        assert!(
            registry
                .extend_heartbeat(&user, &SocketId::from("ghost"))
                .await
                .is_ok()
        );
    }
}
