//! Token-bucket rate limiter (C3), keyed per `(clientId, endpoint)`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_in_ms: u64,
    pub fill_level: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token-bucket limiter holding one independent bucket per key. Discovery
/// and tool-call endpoints must be given distinct key namespaces (e.g.
/// prefixing the endpoint into the key) so a burst on one never starves the
/// other.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_limit(&self, key: &str) -> LimitDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.config.capacity as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refill_rate = self.config.capacity as f64 / self.config.window.as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(self.config.capacity as f64);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let missing = (1.0 - bucket.tokens).max(0.0);
        let reset_in_ms = if bucket.tokens >= self.config.capacity as f64 {
            0
        } else {
            ((missing / refill_rate) * 1000.0).ceil() as u64
        };

        LimitDecision {
            allowed,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_in_ms,
            fill_level: bucket.tokens / self.config.capacity as f64,
        }
    }
}
