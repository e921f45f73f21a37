use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Read-through result cache. Keys are entity-prefixed (`msg:`, `conv:`,
/// `user:`); the prefix labels the hit/miss metrics per entity.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn invalidate(&self, key: &str);
    async fn invalidate_prefix(&self, prefix: &str);
}

pub struct MemoryResultCache {
    inner: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryResultCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let now = Instant::now();
        guard.retain(|_, (_, deadline)| *deadline > now);
        guard.get(key).map(|(value, _)| value.clone())
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.insert(key.to_string(), (value, Instant::now() + ttl));
    }

    async fn invalidate(&self, key: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(key);
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .retain(|key, _| !key.starts_with(prefix));
    }
}

#[cfg(feature = "redis-cache")]
pub struct RedisResultCache {
    namespace: String,
    connection: tokio::sync::Mutex<redis::aio::ConnectionManager>,
}

#[cfg(feature = "redis-cache")]
impl RedisResultCache {
    pub async fn connect(url: &str, namespace: impl Into<String>) -> Result<Self, crate::DalError> {
        let client =
            redis::Client::open(url).map_err(|err| crate::DalError::Store(err.to_string()))?;
        let connection = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|err| crate::DalError::Store(err.to_string()))?;
        Ok(Self {
            namespace: namespace.into(),
            connection: tokio::sync::Mutex::new(connection),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:cache:{}", self.namespace, key)
    }
}

#[cfg(feature = "redis-cache")]
#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, key: &str) -> Option<String> {
        use redis::AsyncCommands;
        let mut conn = self.connection.lock().await;
        conn.get(self.full_key(key)).await.ok().flatten()
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        use redis::AsyncCommands;
        let mut conn = self.connection.lock().await;
        let _: Result<(), _> = conn
            .set_ex(self.full_key(key), value, ttl.as_secs().max(1))
            .await;
    }

    async fn invalidate(&self, key: &str) {
        use redis::AsyncCommands;
        let mut conn = self.connection.lock().await;
        let _: Result<(), _> = conn.del(self.full_key(key)).await;
    }

    async fn invalidate_prefix(&self, prefix: &str) {
        use redis::AsyncCommands;
        let pattern = format!("{}*", self.full_key(prefix));
        let mut conn = self.connection.lock().await;
        let keys: Vec<String> = {
            let mut iter = match conn.scan_match::<_, String>(&pattern).await {
                Ok(iter) => iter,
                Err(_) => return,
            };
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if !keys.is_empty() {
            let _: Result<(), _> = conn.del(keys).await;
        }
    }
}

/// Optional cache front. Absence or `CACHE_BYPASS` degrades to straight
/// store reads; it never affects correctness.
#[derive(Clone)]
pub struct CacheHandle {
    inner: Option<Arc<dyn ResultCache>>,
    bypass: bool,
}

impl CacheHandle {
    pub fn new(inner: Arc<dyn ResultCache>, bypass: bool) -> Self {
        Self {
            inner: Some(inner),
            bypass,
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: None,
            bypass: false,
        }
    }

    fn entity(key: &str) -> String {
        key.split(':').next().unwrap_or("other").to_string()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.bypass {
            return None;
        }
        let cache = self.inner.as_ref()?;
        let started = Instant::now();
        let raw = cache.get(key).await;
        metrics::histogram!("relay_result_cache_seconds")
            .record(started.elapsed().as_secs_f64());
        match raw {
            Some(raw) => {
                metrics::counter!(
                    "relay_result_cache_total",
                    "entity" => Self::entity(key),
                    "result" => "hit"
                )
                .increment(1);
                serde_json::from_str(&raw).ok()
            }
            None => {
                metrics::counter!(
                    "relay_result_cache_total",
                    "entity" => Self::entity(key),
                    "result" => "miss"
                )
                .increment(1);
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if self.bypass {
            return;
        }
        let Some(cache) = self.inner.as_ref() else {
            return;
        };
        match serde_json::to_string(value) {
            Ok(raw) => cache.set(key, raw, ttl).await,
            Err(err) => debug!(%key, error = %err, "cache serialization skipped"),
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Some(cache) = self.inner.as_ref() {
            cache.invalidate(key).await;
        }
    }

    pub async fn invalidate_prefix(&self, prefix: &str) {
        if let Some(cache) = self.inner.as_ref() {
            cache.invalidate_prefix(prefix).await;
        }
    }
}
