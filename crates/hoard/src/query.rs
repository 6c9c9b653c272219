//! Registered queries and their result snapshots.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use crate::coordinator::ResultListener;
use crate::policy::Policy;

/// Opaque handle identifying a registered query.
///
/// Tokens minted by the coordinator are unique per submission and compare by
/// that identity; caller-supplied tokens compare by value, which is what
/// makes replace and dedupe under a stable name work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryToken {
    /// Minted by the coordinator.
    Generated(u64),
    /// Supplied by the caller.
    Custom(String),
}

/// Snapshot of a query's resolved keys, delivered to its listener.
///
/// Each resolved key maps to `Some(value)` or `None`, where `None` covers a
/// permanent not-found outcome and, under the default policy, a key whose
/// transient error was surfaced instead of retried.
#[derive(Debug, Clone)]
pub struct QueryResult<K, V> {
    results: HashMap<K, Option<V>>,
    complete: bool,
}

impl<K, V> QueryResult<K, V>
where
    K: Eq + Hash,
{
    pub(crate) fn new(results: HashMap<K, Option<V>>, complete: bool) -> Self {
        Self { results, complete }
    }

    /// The value resolved for `key`, if the key resolved with a value.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.results.get(key).and_then(|v| v.as_ref())
    }

    /// Whether `key` has any resolution in this snapshot, including a
    /// `None` one.
    pub fn contains(&self, key: &K) -> bool {
        self.results.contains_key(key)
    }

    /// Whether every key of the originating query is resolved. A complete
    /// result is the query's last: the query is removed once it emits.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Number of resolved keys.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Iterate over resolved keys and their outcomes.
    pub fn iter(&self) -> impl Iterator<Item = (&K, Option<&V>)> {
        self.results.iter().map(|(k, v)| (k, v.as_ref()))
    }

    /// Consume the snapshot into its underlying map.
    pub fn into_map(self) -> HashMap<K, Option<V>> {
        self.results
    }
}

impl<K, V> PartialEq for QueryResult<K, V>
where
    K: Eq + Hash,
    V: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.complete == other.complete && self.results == other.results
    }
}

/// A registered interest in a set of keys.
///
/// The key set is fixed at submission; the completion engine owns all the
/// mutable bookkeeping.
pub(crate) struct Query<K, V> {
    /// The keys this query wants resolved.
    pub(crate) keys: HashSet<K>,
    pub(crate) listener: Option<Arc<dyn ResultListener<K, V>>>,
    pub(crate) policy: Policy,
    /// Keys already folded into a computed result for this query.
    pub(crate) accepted: HashSet<K>,
    /// Keys that have seen any response since this query was submitted.
    pub(crate) responded: HashSet<K>,
    /// Last emitted result map, for duplicate suppression.
    pub(crate) last_result: Option<HashMap<K, Option<V>>>,
}

impl<K, V> Query<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new(
        keys: HashSet<K>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
    ) -> Self {
        Self {
            keys,
            listener,
            policy,
            accepted: HashSet::new(),
            responded: HashSet::new(),
            last_result: None,
        }
    }

    /// Query equality: same policy, same listener identity, same key set.
    pub(crate) fn matches(&self, other: &Self) -> bool {
        self.policy == other.policy
            && self.keys == other.keys
            && match (&self.listener, &other.listener) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}
