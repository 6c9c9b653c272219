//! Per-key cache state: resolved values, not-found markers, transient error
//! history, and in-flight bookkeeping.
//!
//! The store is plain data. It is owned by the coordinator and only ever
//! touched under the coordinator lock; thread safety lives one level up.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

use crate::policy::Policy;

/// Ceiling on the error cool-off window, in seconds.
const MAX_COOLOFF_SECS: u64 = 1800;

/// Back-off base for queries routed via the high-priority class.
const ASAP_COOLOFF_BASE_SECS: u64 = 2;

/// Back-off base for everything else.
const DEFAULT_COOLOFF_BASE_SECS: u64 = 10;

/// Error history for one key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ErrorRecord {
    /// When the most recent transient error was recorded.
    pub(crate) at: Instant,
    /// Consecutive transient errors since the last success or not-found.
    pub(crate) count: u32,
}

impl ErrorRecord {
    /// Cool-off window for this record under the given query policy:
    /// `base * count^10` seconds, saturating, capped at [`MAX_COOLOFF_SECS`].
    ///
    /// The curve is extremely steep: with the default base a first error
    /// cools off for 10 s and a second already saturates the cap.
    pub(crate) fn cooloff(&self, policy: Policy) -> Duration {
        let base = if policy.contains(Policy::ASAP) {
            ASAP_COOLOFF_BASE_SECS
        } else {
            DEFAULT_COOLOFF_BASE_SECS
        };
        let secs = u64::from(self.count)
            .saturating_pow(10)
            .saturating_mul(base)
            .min(MAX_COOLOFF_SECS);
        Duration::from_secs(secs)
    }

    /// Whether a retry is due: strictly more than the cool-off window has
    /// elapsed since the error.
    pub(crate) fn retry_due(&self, policy: Policy, now: Instant) -> bool {
        now.saturating_duration_since(self.at) > self.cooloff(policy)
    }

    /// Whether the key is still strictly inside its cool-off window.
    pub(crate) fn in_cooloff(&self, policy: Policy, now: Instant) -> bool {
        now.saturating_duration_since(self.at) < self.cooloff(policy)
    }
}

/// Key-indexed outcome store.
///
/// Per key, at most one of {value present, not-found} holds; error and
/// pending bookkeeping are orthogonal to both.
#[derive(Debug)]
pub(crate) struct CacheStore<K, V> {
    values: HashMap<K, V>,
    not_found: HashSet<K>,
    errors: HashMap<K, ErrorRecord>,
    pending: HashMap<K, Instant>,
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            values: HashMap::new(),
            not_found: HashSet::new(),
            errors: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub(crate) fn value(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    pub(crate) fn is_not_found(&self, key: &K) -> bool {
        self.not_found.contains(key)
    }

    pub(crate) fn error(&self, key: &K) -> Option<ErrorRecord> {
        self.errors.get(key).copied()
    }

    pub(crate) fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Store a successful value. Clears the not-found marker, the error
    /// history, and the pending record for the key.
    pub(crate) fn insert_value(&mut self, key: K, value: V) {
        self.not_found.remove(&key);
        self.errors.remove(&key);
        self.pending.remove(&key);
        self.values.insert(key, value);
    }

    /// Record a permanent not-found resolution. Clears any cached value
    /// (a key is never both resolved and not-found), the error history,
    /// and the pending record.
    pub(crate) fn mark_not_found(&mut self, key: K) {
        self.values.remove(&key);
        self.errors.remove(&key);
        self.pending.remove(&key);
        self.not_found.insert(key);
    }

    /// Record a transient error. Any cached value is retained; only the
    /// pending record is cleared.
    pub(crate) fn record_error(&mut self, key: K, now: Instant) {
        self.pending.remove(&key);
        self.errors
            .entry(key)
            .and_modify(|e| {
                e.at = now;
                e.count = e.count.saturating_add(1);
            })
            .or_insert(ErrorRecord { at: now, count: 1 });
    }

    /// Mark a key as dispatched upstream. Cleared by whichever of
    /// {value, not-found, error} lands next.
    pub(crate) fn mark_pending(&mut self, key: K, now: Instant) {
        self.pending.insert(key, now);
    }

    /// Drop the cached value for a key, leaving its not-found marker and
    /// error history in place.
    pub(crate) fn evict_value(&mut self, key: &K) {
        self.values.remove(key);
    }
}
