use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::IngressAck;

/// Five minutes is the ceiling; anything longer would outlive the retry
/// horizon the key derivation's one-second window is designed for.
const MAX_TTL: Duration = Duration::from_secs(300);

/// Short-TTL map from idempotency key to the ack that was issued for it.
/// Advisory only: the store's unique index is the real guarantee.
pub struct AckCache {
    ttl: Duration,
    inner: Mutex<HashMap<String, (IngressAck, Instant)>>,
}

impl AckCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.min(MAX_TTL),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<IngressAck> {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let now = Instant::now();
        guard.retain(|_, (_, inserted)| now.duration_since(*inserted) <= self.ttl);
        guard.get(key).map(|(ack, _)| ack.clone())
    }

    pub fn put(&self, ack: IngressAck) {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.insert(ack.idempotency_key.clone(), (ack, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{CorrelationId, MessageId};

    fn ack(key: &str) -> IngressAck {
        IngressAck::pending(MessageId::generate(), CorrelationId::generate(), key.into())
    }

    #[test]
    fn put_then_get_roundtrips() {
        let cache = AckCache::new(Duration::from_secs(60));
        let ack = ack("client_abc");
        cache.put(ack.clone());
        assert_eq!(cache.get("client_abc"), Some(ack));
        assert_eq!(cache.get("client_other"), None);
    }

    #[test]
    fn entries_expire() {
        let cache = AckCache::new(Duration::from_millis(5));
        cache.put(ack("client_abc"));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("client_abc"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn ttl_is_capped_at_five_minutes() {
        let cache = AckCache::new(Duration::from_secs(3600));
        assert_eq!(cache.ttl, MAX_TTL);
    }
}
