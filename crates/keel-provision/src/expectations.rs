//! Creation expectations
//!
//! Watch delivery is at-least-once and reads may lag writes, so a reconcile
//! that just created a job can be followed by one that does not see it yet.
//! The tracker remembers how many creations were issued per key and not yet
//! observed; while any are outstanding the controller must not create again.
//!
//! Records are process-local and expire after a TTL so a lost watch event
//! cannot wedge an attempt forever.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// How long an unobserved creation blocks further creates
pub const DEFAULT_EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
struct Expectation {
    outstanding: u32,
    recorded_at: Instant,
}

/// Thread-safe per-key record of creations issued but not yet observed.
///
/// Each operation runs under the map's entry lock for its key, so calls for
/// one key are linearizable and calls for different keys do not contend.
pub struct Expectations {
    pending: DashMap<String, Expectation>,
    ttl: Duration,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new()
    }
}

impl Expectations {
    /// Create a tracker with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_EXPECTATIONS_TTL)
    }

    /// Create a tracker with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    /// Record that `count` creations were issued for `key`, replacing any prior record
    pub fn expect_creations(&self, key: &str, count: u32) {
        debug!(key, count, "expecting creations");
        self.pending.insert(
            key.to_string(),
            Expectation {
                outstanding: count,
                recorded_at: Instant::now(),
            },
        );
    }

    /// A previously expected object became visible; lowers the count toward
    /// zero and forgets the key once nothing is outstanding
    pub fn creation_observed(&self, key: &str) {
        {
            let Some(mut entry) = self.pending.get_mut(key) else {
                return;
            };
            entry.outstanding = entry.outstanding.saturating_sub(1);
            debug!(key, outstanding = entry.outstanding, "creation observed");
        }
        self.pending.remove_if(key, |_, entry| entry.outstanding == 0);
    }

    /// True iff no unobserved, unexpired creations are recorded for `key`
    pub fn satisfied_expectations(&self, key: &str) -> bool {
        match self.pending.get(key) {
            None => true,
            Some(entry) if entry.outstanding == 0 => true,
            Some(entry) if entry.recorded_at.elapsed() >= self.ttl => {
                debug!(key, outstanding = entry.outstanding, "expectations expired");
                true
            }
            Some(_) => false,
        }
    }

    /// Forget everything recorded for `key`
    pub fn delete_expectations(&self, key: &str) {
        self.pending.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unknown_key_is_satisfied() {
        let expectations = Expectations::new();
        assert!(expectations.satisfied_expectations("ns/p"));
    }

    #[test]
    fn outstanding_creation_blocks_until_observed() {
        let expectations = Expectations::new();
        expectations.expect_creations("ns/p", 1);
        assert!(!expectations.satisfied_expectations("ns/p"));

        expectations.creation_observed("ns/p");
        assert!(expectations.satisfied_expectations("ns/p"));
    }

    #[test]
    fn observing_more_than_expected_clamps_at_zero() {
        let expectations = Expectations::new();
        expectations.expect_creations("ns/p", 1);
        expectations.creation_observed("ns/p");
        expectations.creation_observed("ns/p");
        assert!(expectations.satisfied_expectations("ns/p"));

        // a fresh record is not pre-satisfied by the extra observation
        expectations.expect_creations("ns/p", 1);
        assert!(!expectations.satisfied_expectations("ns/p"));
    }

    #[test]
    fn expect_replaces_prior_record() {
        let expectations = Expectations::new();
        expectations.expect_creations("ns/p", 3);
        expectations.expect_creations("ns/p", 1);
        expectations.creation_observed("ns/p");
        assert!(expectations.satisfied_expectations("ns/p"));
    }

    #[test]
    fn observed_keys_are_forgotten() {
        let expectations = Expectations::new();
        for i in 0..1000 {
            let key = format!("ns/p{i}");
            expectations.expect_creations(&key, 1);
            expectations.creation_observed(&key);
        }
        assert!(expectations.pending.is_empty());
    }

    #[test]
    fn partially_observed_key_is_kept() {
        let expectations = Expectations::new();
        expectations.expect_creations("ns/p", 2);
        expectations.creation_observed("ns/p");
        assert_eq!(expectations.pending.len(), 1);
        assert!(!expectations.satisfied_expectations("ns/p"));
    }

    #[test]
    fn keys_are_isolated() {
        let expectations = Expectations::new();
        expectations.expect_creations("ns/a", 1);
        expectations.creation_observed("ns/b");
        assert!(!expectations.satisfied_expectations("ns/a"));
        assert!(expectations.satisfied_expectations("ns/b"));
    }

    #[test]
    fn expired_records_count_as_satisfied() {
        let expectations = Expectations::with_ttl(Duration::ZERO);
        expectations.expect_creations("ns/p", 1);
        assert!(expectations.satisfied_expectations("ns/p"));
    }

    #[test]
    fn delete_resets_key() {
        let expectations = Expectations::new();
        expectations.expect_creations("ns/p", 1);
        expectations.delete_expectations("ns/p");
        assert!(expectations.satisfied_expectations("ns/p"));
    }

    #[test]
    fn concurrent_keys_do_not_interfere() {
        let expectations = Arc::new(Expectations::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let expectations = expectations.clone();
                std::thread::spawn(move || {
                    let key = format!("ns/p{i}");
                    for _ in 0..100 {
                        expectations.expect_creations(&key, 1);
                        assert!(!expectations.satisfied_expectations(&key));
                        expectations.creation_observed(&key);
                        assert!(expectations.satisfied_expectations(&key));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
    }
}
