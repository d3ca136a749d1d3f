// Deduplication engine (spec.md §4.1). Mutex-protected hash map paired
// with an insertion-order deque, generalized from the mutex-protected
// map + FIFO order list pattern DESIGN.md calls out as needing
// re-architecture: a value type owning `{hash→time}` plus a deque,
// all operations behind one exclusive handle (see engine/http.rs's
// `RequestAuditLog` for the sibling ring-buffer idiom this borrows from).

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(600);
const DEFAULT_CAPACITY: usize = 4096;

struct Inner {
    first_seen: HashMap<String, Instant>,
    order: VecDeque<String>,
}

/// TTL + capacity bounded set of recently-seen fingerprints (block
/// hashes or gossip message IDs).
pub struct Deduper {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
    network: String,
    duplicates_suppressed: std::sync::atomic::AtomicU64,
}

impl Deduper {
    pub fn new(ttl: Duration, capacity: usize, network: impl Into<String>) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        Self {
            inner: Mutex::new(Inner {
                first_seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            capacity,
            network: network.into(),
            duplicates_suppressed: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn with_defaults(network: impl Into<String>) -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY, network)
    }

    /// Returns true iff `fingerprint` was recorded within `ttl` of `now`.
    /// Empty fingerprints are never deduplicated. On a false return the
    /// fingerprint is recorded (refreshed to the tail if it had expired).
    pub fn seen(&self, fingerprint: &str, now: Instant) -> bool {
        if fingerprint.is_empty() {
            return false;
        }

        let mut inner = self.inner.lock();

        if let Some(first_seen) = inner.first_seen.get(fingerprint).copied() {
            if now.duration_since(first_seen) <= self.ttl {
                self.duplicates_suppressed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return true;
            }
            // Expired: treat as new, refresh to tail.
            inner.first_seen.remove(fingerprint);
        }

        if inner.first_seen.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.first_seen.remove(&oldest);
            }
        }

        inner.order.push_back(fingerprint.to_string());
        inner.first_seen.insert(fingerprint.to_string(), now);
        false
    }

    /// Compacts the FIFO list in place, removing entries older than `ttl`.
    /// Callers invoke this on a timer; it performs no I/O.
    pub fn cleanup(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let ttl = self.ttl;
        let Inner { first_seen, order } = &mut *inner;
        order.retain(|fp| {
            first_seen
                .get(fp)
                .map(|t| now.duration_since(*t) <= ttl)
                .unwrap_or(false)
        });
        first_seen.retain(|_, t| now.duration_since(*t) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duplicates_suppressed(&self) -> u64 {
        self.duplicates_suppressed
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn network(&self) -> &str {
        &self.network
    }
}

/// A nil/absent deduper fails open: `Seen` always returns false and
/// nothing is recorded (spec.md §4.1).
pub struct NullDeduper;

impl NullDeduper {
    pub fn seen(&self, _fingerprint: &str, _now: Instant) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_dedup_within_ttl() {
        let d = Deduper::new(Duration::from_secs(600), 4096, "btc");
        let t0 = Instant::now();
        assert!(!d.seen("aa", t0));
        assert!(d.seen("aa", t0 + Duration::from_secs(1)));
        assert_eq!(d.duplicates_suppressed(), 1);
        assert!(!d.seen("aa", t0 + Duration::from_secs(601)));
    }

    #[test]
    fn s2_capacity_eviction() {
        let d = Deduper::new(Duration::from_secs(600), 2, "btc");
        let t0 = Instant::now();
        assert!(!d.seen("a", t0));
        assert!(!d.seen("b", t0));
        assert!(!d.seen("c", t0));
        assert!(!d.seen("a", t0)); // evicted, treated as new
        assert!(d.seen("b", t0)); // still present
    }

    #[test]
    fn empty_fingerprint_never_deduplicated() {
        let d = Deduper::with_defaults("btc");
        let t0 = Instant::now();
        assert!(!d.seen("", t0));
        assert!(!d.seen("", t0));
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn non_positive_config_falls_back_to_defaults() {
        let d = Deduper::new(Duration::ZERO, 0, "btc");
        assert_eq!(d.ttl, DEFAULT_TTL);
        assert_eq!(d.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn invariant_set_and_order_len_match() {
        let d = Deduper::new(Duration::from_secs(600), 3, "btc");
        let t0 = Instant::now();
        for h in ["a", "b", "c", "d", "e"] {
            d.seen(h, t0);
        }
        let inner = d.inner.lock();
        assert!(inner.first_seen.len() <= 3);
        assert_eq!(inner.first_seen.len(), inner.order.len());
    }

    #[test]
    fn cleanup_removes_expired_entries() {
        let d = Deduper::new(Duration::from_secs(10), 4096, "btc");
        let t0 = Instant::now();
        d.seen("a", t0);
        d.cleanup(t0 + Duration::from_secs(20));
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn null_deduper_always_fails_open() {
        let d = NullDeduper;
        let t0 = Instant::now();
        assert!(!d.seen("a", t0));
        assert!(!d.seen("a", t0));
    }
}
