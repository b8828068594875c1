//! Stale-while-revalidate cache with single-flight origin refresh.
//!
//! ## Lookup
//!
//! | State   | Returned | Origin call                         |
//! |---------|----------|-------------------------------------|
//! | Fresh   | yes      | none                                |
//! | Stale   | yes      | one background refresh per key      |
//! | Expired | no       | caller waits for the refresh result |
//! | Absent  | no       | caller waits for the refresh result |
//!
//! Refreshes for the same key are coalesced: while one is in flight, every
//! caller that needs the origin joins it instead of starting another. The
//! refresh runs on its own task, so a caller giving up does not cancel it
//! for the others.
//!
//! ## Eviction
//!
//! Bounded by `max_size`. Every write moves its key to the young end of the
//! write order, and inserting past the bound drops the oldest write first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::entry::{CacheEntry, CacheOptions, EntryState};
use super::origin::OriginFetcher;
use super::{CacheError, CacheStats};

type Fetched<T> = Result<Option<T>, CacheError>;
type SharedRefresh<T> = Shared<BoxFuture<'static, Fetched<T>>>;

/// Entries plus their write order, guarded together so both always agree.
struct Store<T> {
    entries: HashMap<String, CacheEntry<T>>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<T> Store<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, key: &str, value: T, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(old) = self
            .entries
            .insert(key.to_string(), CacheEntry::new(value, now, seq))
        {
            self.order.remove(&old.seq);
        }
        self.order.insert(seq, key.to_string());
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.order.remove(&old.seq);
                true
            }
            None => false,
        }
    }

    /// Drop oldest writes until at most `max_size` entries remain.
    fn evict_over(&mut self, max_size: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_size {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted += 1;
        }
        evicted
    }
}

struct Inner<T> {
    name: String,
    options: CacheOptions,
    store: RwLock<Store<T>>,
    inflight: Mutex<HashMap<String, SharedRefresh<T>>>,
    fetcher: Arc<dyn OriginFetcher<T>>,
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    refresh_errors: AtomicU64,
    evictions: AtomicU64,
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn store_value(&self, key: &str, value: T) {
        let evicted = {
            let mut store = self.store.write();
            store.insert(key, value, Instant::now());
            store.evict_over(self.options.max_size)
        };

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_cache_evictions(&self.name, evicted);
            tracing::debug!(cache = %self.name, evicted, "evicted oldest cache entries");
        }
    }

    fn remove_value(&self, key: &str) -> bool {
        self.store.write().remove(key)
    }

    /// Ask the origin for `key` and install the answer.
    ///
    /// A confirmed absence drops any entry still held for the key; a failure
    /// leaves the cache untouched.
    async fn refresh(&self, key: &str) -> Fetched<T> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome =
            match tokio::time::timeout(self.options.origin_timeout, self.fetcher.fetch(key)).await {
                Ok(result) => result,
                Err(_) => Err(keyguard_core::OriginError::Timeout(self.options.origin_timeout)),
            };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Some(value)) => {
                self.store_value(key, value.clone());
                tracing::debug!(cache = %self.name, key = %key, outcome = "hit", latency_ms, "refreshed from origin");
                crate::metrics::record_cache_refresh(&self.name, "hit");
                Ok(Some(value))
            }
            Ok(None) => {
                self.remove_value(key);
                tracing::debug!(cache = %self.name, key = %key, outcome = "miss", latency_ms, "origin has no such entry");
                crate::metrics::record_cache_refresh(&self.name, "miss");
                Ok(None)
            }
            Err(e) => {
                self.refresh_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(cache = %self.name, key = %key, outcome = "error", latency_ms, error = %e, "origin refresh failed");
                crate::metrics::record_cache_refresh(&self.name, "error");
                Err(CacheError::origin_unavailable(&self.name, key, &e))
            }
        }
    }
}

/// Generic freshness-tiered cache over an origin fetcher.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct FreshnessCache<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FreshnessCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> FreshnessCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        options: CacheOptions,
        fetcher: Arc<dyn OriginFetcher<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                store: RwLock::new(Store::new()),
                inflight: Mutex::new(HashMap::new()),
                fetcher,
                hits: AtomicU64::new(0),
                stale_hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
                refresh_errors: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// Look up `key`, consulting the origin when the entry is not servable.
    ///
    /// `Ok(None)` means the origin confirmed the entry does not exist.
    /// `Err` means the origin could not be asked; nothing was cached.
    pub async fn get(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.lookup(key) {
            Some((value, EntryState::Fresh)) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(&self.inner.name, "fresh");
                Ok(Some(value))
            }
            Some((value, EntryState::Stale)) => {
                self.inner.stale_hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(&self.inner.name, "stale");
                tracing::debug!(cache = %self.inner.name, key = %key, "serving stale entry, revalidating");
                // The refresh task runs to completion on its own.
                drop(self.join_refresh(key));
                Ok(Some(value))
            }
            Some((_, EntryState::Expired)) | None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(&self.inner.name, "miss");
                self.join_refresh(key).await
            }
        }
    }

    /// Current value and tier of `key`, without touching the origin.
    pub fn peek(&self, key: &str) -> Option<(T, EntryState)> {
        self.lookup(key)
    }

    /// Install `value` as a fresh entry.
    pub fn set(&self, key: &str, value: T) {
        self.inner.store_value(key, value);
    }

    /// Remove `key`. Removing an absent key is a no-op.
    pub fn remove(&self, key: &str) {
        if self.inner.remove_value(key) {
            tracing::debug!(cache = %self.inner.name, key = %key, "cache entry removed");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut store = self.inner.store.write();
        store.entries.clear();
        store.order.clear();
    }

    /// Drop every Expired entry. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let options = self.inner.options;

        let mut store = self.inner.store.write();
        let expired: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, entry)| options.state_at(entry.written_at, now) == EntryState::Expired)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            store.remove(key);
        }
        let remaining = store.entries.len();
        drop(store);

        crate::metrics::set_cache_entries(&self.inner.name, remaining);
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            stale_hits: self.inner.stale_hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            refreshes: self.inner.refreshes.load(Ordering::Relaxed),
            refresh_errors: self.inner.refresh_errors.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Run `prune_expired` every `interval` until `shutdown` flips to true.
    pub fn spawn_janitor(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.prune_expired();
                        if removed > 0 {
                            tracing::debug!(cache = %cache.name(), removed, "pruned expired entries");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!(cache = %cache.name(), "cache janitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn lookup(&self, key: &str) -> Option<(T, EntryState)> {
        let now = Instant::now();
        let store = self.inner.store.read();
        store.entries.get(key).map(|entry| {
            (
                entry.value.clone(),
                self.inner.options.state_at(entry.written_at, now),
            )
        })
    }

    /// Return the in-flight refresh for `key`, starting one if there is none.
    fn join_refresh(&self, key: &str) -> SharedRefresh<T> {
        let mut inflight = self.inner.inflight.lock();
        if let Some(existing) = inflight.get(key) {
            return existing.clone();
        }

        let inner = Arc::clone(&self.inner);
        let owned = key.to_string();
        // The task clears its own slot; it cannot run before this lock is released.
        let handle = tokio::spawn(async move {
            let result = inner.refresh(&owned).await;
            inner.inflight.lock().remove(&owned);
            result
        });

        let name = self.inner.name.clone();
        let owned = key.to_string();
        let refresh = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(cache = %name, key = %owned, error = %e, "refresh task failed");
                    Err(CacheError::RefreshAborted {
                        cache: name,
                        key: owned,
                    })
                }
            }
        }
        .boxed()
        .shared();

        inflight.insert(key.to_string(), refresh.clone());
        refresh
    }
}
