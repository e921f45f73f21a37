use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use relay_core::UserId;

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub per_second: f64,
    pub burst: f64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            per_second: 5.0,
            burst: 10.0,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-sender token bucket on the producer fast path. Non-blocking: a sender
/// out of tokens is throttled, not queued.
pub struct SenderRateLimiter {
    limit: RateLimit,
    buckets: Mutex<HashMap<UserId, Bucket>>,
}

impl SenderRateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, sender: &UserId) -> bool {
        let mut guard = self.buckets.lock().unwrap_or_else(|err| err.into_inner());
        let now = Instant::now();
        let bucket = guard.entry(sender.clone()).or_insert(Bucket {
            tokens: self.limit.burst,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.limit.per_second).min(self.limit.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
