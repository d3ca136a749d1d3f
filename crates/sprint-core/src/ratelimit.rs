// Tier-aware rate limiter (spec.md §4.7). Token bucket per
// (client, endpoint), single lock over the bucket map; individual
// bucket state (tokens, last refill) is internal to the bucket so the
// lock is only held for map lookup/insert, not for the refill math.
// Modeled on the webhook bridge's per-IP `RateLimiter` in
// engine/webhook.rs, generalized to per-(client, endpoint) keys, tiers,
// and a burst-capacity token bucket instead of a fixed-window counter.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, now: Instant) -> Self {
        let capacity = rate * 2.0;
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Consumes one token if available. Tokens never exceed `2*rate`
    /// and never go negative (invariant 5).
    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn is_full(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.rate) >= self.capacity
    }
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, String), TokenBucket>>,
    limits: HashMap<String, f64>,
    default_limit: f64,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, f64>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limits,
            default_limit: 1.0,
        }
    }

    fn rate_for(&self, endpoint: &str, turbo: bool) -> f64 {
        let base = self.limits.get(endpoint).copied().unwrap_or(self.default_limit);
        if turbo {
            base * 5.0
        } else {
            base
        }
    }

    /// Consumes one token for `(client, endpoint)`, creating the bucket
    /// on first use. Returns false (→ HTTP 429) when exhausted.
    pub fn allow(&self, client: &str, endpoint: &str, turbo: bool, now: Instant) -> bool {
        let rate = self.rate_for(endpoint, turbo);
        let key = (client.to_string(), endpoint.to_string());
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(rate, now));
        bucket.rate = rate;
        bucket.capacity = rate * 2.0;
        bucket.try_consume(now)
    }

    /// Discards buckets that are currently full (no recent traffic),
    /// invoked by a background sweeper every 30s (spec.md §4.7).
    pub fn sweep(&self, now: Instant) {
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| !bucket.is_full(now));
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}
