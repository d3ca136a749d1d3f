// Per-endpoint exponential backoff with jitter (spec.md §3 NodeBackoff,
// §4.2). One registry entry per RPC endpoint; a single lock guards the
// map, mirroring the rate limiter's bucket-map policy (no I/O under lock).

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct NodeBackoff {
    pub until: Option<Instant>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Default for NodeBackoff {
    fn default() -> Self {
        Self {
            until: None,
            attempts: 0,
            last_error: None,
        }
    }
}

pub struct BackoffRegistry {
    entries: Mutex<HashMap<String, NodeBackoff>>,
}

impl Default for BackoffRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True if `endpoint` is currently serving its backoff window.
    pub fn is_backed_off(&self, endpoint: &str, now: Instant) -> bool {
        self.entries
            .lock()
            .get(endpoint)
            .and_then(|e| e.until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    /// Records a failure, computing `base * 2^(attempts-1)` capped at
    /// `MAX_DELAY` plus uniform jitter.
    pub fn record_failure(&self, endpoint: &str, now: Instant, error: impl Into<String>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(endpoint.to_string()).or_default();
        entry.attempts += 1;
        entry.last_error = Some(error.into());
        let delay = backoff_delay(entry.attempts);
        entry.until = Some(now + delay);
    }

    pub fn clear(&self, endpoint: &str) {
        self.entries.lock().remove(endpoint);
    }

    pub fn attempts(&self, endpoint: &str) -> u32 {
        self.entries
            .lock()
            .get(endpoint)
            .map(|e| e.attempts)
            .unwrap_or(0)
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(10);
    let base = BASE_DELAY.saturating_mul(1u32 << exp);
    let capped = base.min(MAX_DELAY);
    let jitter_ms = rand::thread_rng().gen_range(0..=(capped.as_millis() as u64 / 4).max(1));
    capped + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_backed_off_initially() {
        let reg = BackoffRegistry::new();
        assert!(!reg.is_backed_off("node-a", Instant::now()));
    }

    #[test]
    fn failure_trips_backoff_window() {
        let reg = BackoffRegistry::new();
        let t0 = Instant::now();
        reg.record_failure("node-a", t0, "timeout");
        assert!(reg.is_backed_off("node-a", t0));
        assert_eq!(reg.attempts("node-a"), 1);
    }

    #[test]
    fn clear_removes_backoff() {
        let reg = BackoffRegistry::new();
        let t0 = Instant::now();
        reg.record_failure("node-a", t0, "timeout");
        reg.clear("node-a");
        assert!(!reg.is_backed_off("node-a", t0));
        assert_eq!(reg.attempts("node-a"), 0);
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let short = backoff_delay(1);
        let long = backoff_delay(20);
        assert!(short < long || long >= MAX_DELAY);
        assert!(long <= MAX_DELAY + Duration::from_millis(MAX_DELAY.as_millis() as u64 / 4));
    }
}
