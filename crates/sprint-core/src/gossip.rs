// SeenMessages store backing gossip-loop suppression (spec.md §3, §4.8).
// Single RW lock; `record_if_new` performs the check-and-insert
// atomically under the write lock so concurrent relayers cannot both
// observe "not seen" for the same message_id.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const SWEEP_MAX_AGE: Duration = Duration::from_secs(3600);

pub struct SeenMessages {
    entries: RwLock<HashMap<String, Instant>>,
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new()
    }
}

impl SeenMessages {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.read().contains_key(message_id)
    }

    /// Returns true iff `message_id` was newly recorded (i.e. this is
    /// the first time it has been seen); false if it was already
    /// present. At-most-once relay relies on callers only acting on a
    /// `true` result.
    pub fn record_if_new(&self, message_id: &str, now: Instant) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(message_id) {
            false
        } else {
            entries.insert(message_id.to_string(), now);
            true
        }
    }

    /// Evicts entries older than one hour. Invoked by a sweeper every
    /// 5 minutes (spec.md §4.8).
    pub fn sweep(&self, now: Instant) {
        self.entries
            .write()
            .retain(|_, seen_at| now.duration_since(*seen_at) <= SWEEP_MAX_AGE);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariant_3_at_most_once() {
        let seen = SeenMessages::new();
        let t0 = Instant::now();
        assert!(seen.record_if_new("m1", t0));
        assert!(!seen.record_if_new("m1", t0));
        assert!(!seen.record_if_new("m1", t0));
    }

    #[test]
    fn sweep_evicts_entries_older_than_an_hour() {
        let seen = SeenMessages::new();
        let t0 = Instant::now();
        seen.record_if_new("m1", t0);
        seen.sweep(t0 + Duration::from_secs(3700));
        assert!(seen.is_empty());
    }

    #[test]
    fn sweep_keeps_fresh_entries() {
        let seen = SeenMessages::new();
        let t0 = Instant::now();
        seen.record_if_new("m1", t0);
        seen.sweep(t0 + Duration::from_secs(60));
        assert!(seen.contains("m1"));
    }
}
