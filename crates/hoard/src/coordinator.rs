//! The coordinator: submission, dispatch, result ingestion, and completion.
//!
//! One coordinator is instantiated per data domain. All mutable state lives
//! behind a single coarse lock; the requester and listener callbacks are
//! always invoked with that lock released, so they may call straight back
//! into the coordinator.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::CoordinatorError;
use crate::policy::Policy;
use crate::query::{Query, QueryResult, QueryToken};
use crate::store::CacheStore;
use crate::ticker;

/// Default scheduler tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Upstream bulk fetcher.
///
/// Invoked with three disjoint key sets in priority order: `asap` is "do
/// now", `normal` is "do as soon as convenient", and `backlog` is known of
/// but not yet due. The backlog is informational, usually only worth
/// folding into a request that is happening anyway.
///
/// Contract: call [`Coordinator::mark_requested`] for every key accepted
/// into an upstream call before doing any I/O for it, and eventually report
/// each marked key back through [`Coordinator::set_value`],
/// [`Coordinator::set_not_found`] or [`Coordinator::set_error`]. I/O
/// failures are the requester's to translate into `set_error`; the
/// coordinator does not observe them.
#[async_trait]
pub trait Requester<K, V>: Send + Sync {
    async fn request(
        &self,
        coordinator: &Coordinator<K, V>,
        asap: HashSet<K>,
        normal: HashSet<K>,
        backlog: HashSet<K>,
    );
}

/// Receiver for one query's result snapshots.
///
/// Invoked without the coordinator lock held. A listener failing is the
/// caller's problem; it must not assume the coordinator saw anything.
#[async_trait]
pub trait ResultListener<K, V>: Send + Sync {
    async fn on_result(&self, result: QueryResult<K, V>);
}

/// Cached bulk request coordinator, parameterized over the key and value
/// types of one data domain.
pub struct Coordinator<K, V> {
    inner: Mutex<Inner<K, V>>,
    requester: Arc<dyn Requester<K, V>>,
    /// Coordinator-level policy bits (only `DAEMON` is meaningful here).
    policy: Policy,
    /// Non-reentrant dispatch guard.
    dispatching: AtomicBool,
    closed: AtomicBool,
    next_token: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    /// Dispatch cycles that ran (overlapping invocations excluded).
    dispatches: AtomicU64,
    /// Listener invocations delivered.
    emissions: AtomicU64,
}

struct Inner<K, V> {
    store: CacheStore<K, V>,
    /// Registered queries in submission order. Delivery walks this order.
    queries: IndexMap<QueryToken, Query<K, V>>,
}

impl<K, V> Coordinator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a coordinator with the default configuration and start its
    /// scheduler. Must be called within a tokio runtime.
    pub fn new(requester: Arc<dyn Requester<K, V>>) -> Arc<Self> {
        Self::start(DEFAULT_TICK_INTERVAL, Policy::empty(), requester)
    }

    /// Start building a coordinator with a non-default configuration.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    fn start(
        tick_interval: Duration,
        policy: Policy,
        requester: Arc<dyn Requester<K, V>>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Arc::new(Self {
            inner: Mutex::new(Inner {
                store: CacheStore::new(),
                queries: IndexMap::new(),
            }),
            requester,
            policy,
            dispatching: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_token: AtomicU64::new(0),
            shutdown_tx,
            dispatches: AtomicU64::new(0),
            emissions: AtomicU64::new(0),
        });
        tokio::spawn(ticker::run(
            Arc::downgrade(&coordinator),
            tick_interval,
            shutdown_rx,
        ));
        info!(tick_secs = tick_interval.as_secs(), "coordinator started");
        coordinator
    }

    /// Register interest in `keys` under a freshly minted token.
    ///
    /// Returns `None` if the key set is empty, the coordinator is closed,
    /// or a policy bit (`UNIQUE`) rejected the submission.
    pub async fn submit(
        &self,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: impl IntoIterator<Item = K>,
    ) -> Option<QueryToken> {
        self.submit_inner(None, listener, policy, keys.into_iter().collect())
            .await
    }

    /// Register interest in `keys` under a caller-supplied token.
    ///
    /// Resubmitting a token replaces the earlier query (its listener never
    /// fires again) unless `NO_REPLACE` is set.
    pub async fn submit_as(
        &self,
        token: impl Into<String>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: impl IntoIterator<Item = K>,
    ) -> Option<QueryToken> {
        self.submit_inner(
            Some(token.into()),
            listener,
            policy,
            keys.into_iter().collect(),
        )
        .await
    }

    async fn submit_inner(
        &self,
        token: Option<String>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: HashSet<K>,
    ) -> Option<QueryToken> {
        if self.closed.load(Ordering::SeqCst) {
            debug!("coordinator is closed, dropping submit");
            return None;
        }
        if keys.is_empty() {
            trace!("empty key set, dropping submit");
            return None;
        }

        let query = Query::new(keys, listener, policy);
        let token = {
            let mut inner = self.inner.lock();
            if policy.contains(Policy::UNIQUE)
                && inner.queries.values().any(|q| q.matches(&query))
            {
                debug!("equal query already registered, dropping submit");
                return None;
            }
            let token = match token {
                Some(name) => QueryToken::Custom(name),
                None => QueryToken::Generated(self.next_token.fetch_add(1, Ordering::Relaxed)),
            };
            if policy.contains(Policy::NO_REPLACE) && inner.queries.contains_key(&token) {
                debug!("token already registered, dropping submit");
                return None;
            }
            if policy.contains(Policy::REFRESH) {
                for key in &query.keys {
                    inner.store.evict_value(key);
                }
            }
            if inner.queries.insert(token.clone(), query).is_some() {
                debug!("replaced query registered under the same token");
            }
            token
        };

        // The new query may already be satisfiable straight from cache.
        self.run_completion().await;
        if policy.contains(Policy::ASAP) {
            self.dispatch().await;
        }
        Some(token)
    }

    /// The cached value for `key`, if one is present.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().store.value(key).cloned()
    }

    /// Resolve as much of `keys` as the cache can answer right now.
    ///
    /// If every key already has a resolution the snapshot alone is returned
    /// and nothing is registered. Otherwise the partial snapshot is returned
    /// together with the token of a newly registered query covering the
    /// rest.
    pub async fn get_or_submit(
        &self,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: impl IntoIterator<Item = K>,
    ) -> (QueryResult<K, V>, Option<QueryToken>) {
        self.get_or_submit_inner(None, listener, policy, keys.into_iter().collect())
            .await
    }

    /// [`Coordinator::get_or_submit`] under a caller-supplied token.
    pub async fn get_or_submit_as(
        &self,
        token: impl Into<String>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: impl IntoIterator<Item = K>,
    ) -> (QueryResult<K, V>, Option<QueryToken>) {
        self.get_or_submit_inner(
            Some(token.into()),
            listener,
            policy,
            keys.into_iter().collect(),
        )
        .await
    }

    async fn get_or_submit_inner(
        &self,
        token: Option<String>,
        listener: Option<Arc<dyn ResultListener<K, V>>>,
        policy: Policy,
        keys: HashSet<K>,
    ) -> (QueryResult<K, V>, Option<QueryToken>) {
        let snapshot = {
            let inner = self.inner.lock();
            let now = Instant::now();
            let mut results = HashMap::new();
            for key in &keys {
                // A refresh query needs a response newer than its own
                // submission, so nothing already cached is eligible.
                if policy.contains(Policy::REFRESH) {
                    continue;
                }
                if let Some(value) = inner.store.value(key) {
                    results.insert(key.clone(), Some(value.clone()));
                } else if inner.store.is_not_found(key) {
                    results.insert(key.clone(), None);
                } else if let Some(record) = inner.store.error(key) {
                    if record.in_cooloff(policy, now) && !policy.holds_errors() {
                        results.insert(key.clone(), None);
                    }
                }
            }
            let complete = results.len() == keys.len();
            QueryResult::new(results, complete)
        };

        if snapshot.is_complete() {
            return (snapshot, None);
        }
        let token = self.submit_inner(token, listener, policy, keys).await;
        (snapshot, token)
    }

    /// Record a successful value for `key`.
    pub async fn set_value(&self, key: K, value: V) {
        {
            let mut inner = self.inner.lock();
            let Inner { store, queries } = &mut *inner;
            store.insert_value(key.clone(), value);
            note_response(queries, &key);
        }
        trace!("cache: value stored");
        self.run_completion().await;
    }

    /// Record successful values in bulk, under one lock acquisition and one
    /// completion pass.
    pub async fn set_values(&self, values: impl IntoIterator<Item = (K, V)>) {
        let stored = {
            let mut inner = self.inner.lock();
            let Inner { store, queries } = &mut *inner;
            let mut stored = 0usize;
            for (key, value) in values {
                store.insert_value(key.clone(), value);
                note_response(queries, &key);
                stored += 1;
            }
            stored
        };
        if stored == 0 {
            return;
        }
        trace!(count = stored, "cache: values stored");
        self.run_completion().await;
    }

    /// Record a permanent not-found resolution for each key.
    pub async fn set_not_found(&self, keys: impl IntoIterator<Item = K>) {
        let marked = {
            let mut inner = self.inner.lock();
            let Inner { store, queries } = &mut *inner;
            let mut marked = 0usize;
            for key in keys {
                store.mark_not_found(key.clone());
                note_response(queries, &key);
                marked += 1;
            }
            marked
        };
        if marked == 0 {
            return;
        }
        trace!(count = marked, "cache: keys marked not-found");
        self.run_completion().await;
    }

    /// Record a transient error for each key. Cached values survive; the
    /// per-key error count governs the retry cool-off.
    pub async fn set_error(&self, keys: impl IntoIterator<Item = K>) {
        let errored = {
            let mut inner = self.inner.lock();
            let Inner { store, queries } = &mut *inner;
            let now = Instant::now();
            let mut errored = 0usize;
            for key in keys {
                store.record_error(key.clone(), now);
                note_response(queries, &key);
                errored += 1;
            }
            errored
        };
        if errored == 0 {
            return;
        }
        trace!(count = errored, "cache: errors recorded");
        self.run_completion().await;
    }

    /// Mark keys as accepted into an in-flight upstream call. Marked keys
    /// are excluded from dispatch until a response lands for them.
    pub async fn mark_requested(&self, keys: impl IntoIterator<Item = K>) {
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            for key in keys {
                inner.store.mark_pending(key, now);
            }
        }
        self.run_completion().await;
    }

    /// Run one dispatch cycle: partition every outstanding key into the
    /// three urgency classes and hand the due ones to the requester.
    ///
    /// Non-reentrant: an invocation that overlaps a running cycle is
    /// dropped with a warning.
    pub async fn dispatch(&self) {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            warn!("dispatch already in progress, dropping overlapping invocation");
            return;
        }
        let _guard = DispatchGuard(&self.dispatching);
        self.dispatches.fetch_add(1, Ordering::Relaxed);

        let (asap, normal, backlog) = {
            let inner = self.inner.lock();
            let now = Instant::now();
            let mut asap = HashSet::new();
            let mut normal = HashSet::new();
            let mut backlog = HashSet::new();
            for query in inner.queries.values() {
                for key in &query.keys {
                    if inner.store.is_pending(key) || query.accepted.contains(key) {
                        continue;
                    }
                    if key_ready(&inner.store, query, key, now) {
                        if query.policy.contains(Policy::ASAP) {
                            asap.insert(key.clone());
                        } else {
                            normal.insert(key.clone());
                        }
                    } else {
                        backlog.insert(key.clone());
                    }
                }
            }
            // Resolve overlaps by priority.
            for key in &asap {
                normal.remove(key);
                backlog.remove(key);
            }
            for key in &normal {
                backlog.remove(key);
            }
            (asap, normal, backlog)
        };

        if asap.is_empty() && normal.is_empty() {
            trace!(backlog = backlog.len(), "dispatch: nothing due");
            return;
        }

        debug!(
            asap = asap.len(),
            normal = normal.len(),
            backlog = backlog.len(),
            "dispatching upstream request"
        );
        self.requester.request(self, asap, normal, backlog).await;
    }

    /// Recompute every registered query against the cache, emit changed
    /// results, and drop completed queries.
    async fn run_completion(&self) {
        let emissions: Vec<(Arc<dyn ResultListener<K, V>>, QueryResult<K, V>)> = {
            let mut inner = self.inner.lock();
            let Inner { store, queries } = &mut *inner;
            let now = Instant::now();
            let mut emissions = Vec::new();
            let mut completed = Vec::new();

            for (token, query) in queries.iter_mut() {
                let mut results: HashMap<K, Option<V>> = HashMap::new();
                let mut wait_errors = 0usize;

                for key in &query.keys {
                    if query.policy.contains(Policy::REFRESH) && !query.responded.contains(key) {
                        continue;
                    }
                    if let Some(value) = store.value(key) {
                        results.insert(key.clone(), Some(value.clone()));
                    } else if store.is_not_found(key) {
                        results.insert(key.clone(), None);
                    } else if let Some(record) = store.error(key) {
                        if record.in_cooloff(query.policy, now) {
                            if query.policy.holds_errors() {
                                // Held back: the query keeps waiting for a
                                // successful retry.
                                wait_errors += 1;
                            } else {
                                results.insert(key.clone(), None);
                            }
                        }
                    }
                }

                for key in results.keys() {
                    query.accepted.insert(key.clone());
                }

                let has_all = results.len() == query.keys.len();
                let has_all_or_errors = results.len() + wait_errors == query.keys.len();
                let should_emit = has_all
                    || (query.policy.intersects(Policy::PARTIAL | Policy::RETRY)
                        && !results.is_empty()
                        && (query.policy.contains(Policy::PARTIAL) || has_all_or_errors));

                if should_emit && query.last_result.as_ref() != Some(&results) {
                    if let Some(listener) = &query.listener {
                        emissions.push((
                            Arc::clone(listener),
                            QueryResult::new(results.clone(), has_all),
                        ));
                    }
                    query.last_result = Some(results);
                }

                if has_all {
                    completed.push(token.clone());
                }
            }

            for token in &completed {
                queries.shift_remove(token);
            }
            if !completed.is_empty() {
                debug!(
                    completed = completed.len(),
                    remaining = queries.len(),
                    "queries completed"
                );
            }
            emissions
        };

        for (listener, result) in emissions {
            self.emissions.fetch_add(1, Ordering::Relaxed);
            listener.on_result(result).await;
        }
    }

    /// Number of registered queries.
    pub fn pending_requests(&self) -> usize {
        self.inner.lock().queries.len()
    }

    /// Short human-readable status line.
    pub fn debug(&self) -> String {
        let (queries, pending) = {
            let inner = self.inner.lock();
            (inner.queries.len(), inner.store.pending_len())
        };
        format!(
            "queries: {queries} / pending keys: {pending} / dispatches: {} / emissions: {}",
            self.dispatches.load(Ordering::Relaxed),
            self.emissions.load(Ordering::Relaxed),
        )
    }

    /// Coordinator-level policy bits supplied at construction.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Stop the scheduler and refuse further submits. Idempotent. Result
    /// ingestion keeps working so an outstanding upstream batch can still
    /// land.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        info!("coordinator closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Record a response against every registered query that covers the key.
fn note_response<K, V>(queries: &mut IndexMap<QueryToken, Query<K, V>>, key: &K)
where
    K: Eq + Hash + Clone,
{
    for query in queries.values_mut() {
        if query.keys.contains(key) {
            query.responded.insert(key.clone());
        }
    }
}

/// Readiness of one key for one query: a refresh query that has not yet
/// seen a response is always ready; otherwise readiness is governed by the
/// key's error cool-off.
fn key_ready<K, V>(store: &CacheStore<K, V>, query: &Query<K, V>, key: &K, now: Instant) -> bool
where
    K: Eq + Hash + Clone,
{
    if query.policy.contains(Policy::REFRESH) && !query.responded.contains(key) {
        return true;
    }
    match store.error(key) {
        None => true,
        Some(record) => record.retry_due(query.policy, now),
    }
}

/// Resets the non-reentrant dispatch flag when a cycle ends.
struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Builder for a coordinator with a non-default configuration.
pub struct CoordinatorBuilder {
    tick_interval: Duration,
    policy: Policy,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            policy: Policy::empty(),
        }
    }

    /// Set the scheduler tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set coordinator-level policy bits (`DAEMON` is the only one with
    /// coordinator scope).
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the coordinator and start its scheduler. Must be called within
    /// a tokio runtime.
    pub fn build<K, V>(
        self,
        requester: Arc<dyn Requester<K, V>>,
    ) -> Result<Arc<Coordinator<K, V>>, CoordinatorError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + PartialEq + Send + Sync + 'static,
    {
        if self.tick_interval.is_zero() {
            return Err(CoordinatorError::InvalidConfig(
                "tick interval must be non-zero".to_string(),
            ));
        }
        Ok(Coordinator::start(
            self.tick_interval,
            self.policy,
            requester,
        ))
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
