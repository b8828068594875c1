//! Node-local caches for Keys and Apis.
//!
//! ## Architecture
//!
//! - [`FreshnessCache`]: stale-while-revalidate cache with single-flight
//!   origin refresh and write-order eviction.
//! - [`OriginFetcher`]: one-method capability the cache calls on a miss,
//!   with adapters over the origin store.
//! - [`Cache`]: the surface invalidation and warming code program against,
//!   so a node can run with caching switched off ([`NoopCache`]).

mod entry;
mod freshness;
mod origin;

pub use entry::{CacheOptions, EntryState};
pub use freshness::FreshnessCache;
pub use origin::{ApiById, ApiByKeyAuthId, KeyByHash, OriginFetcher};

use std::marker::PhantomData;

use async_trait::async_trait;
use keyguard_core::OriginError;
use thiserror::Error;

/// Errors returned by cache lookups.
///
/// Cloneable because one refresh result is handed to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The origin could not answer; nothing was cached.
    #[error("origin unavailable refreshing {cache} entry {key}: {message}")]
    OriginUnavailable {
        cache: String,
        key: String,
        message: String,
    },

    /// The refresh task died before producing a result.
    #[error("refresh of {cache} entry {key} was aborted")]
    RefreshAborted { cache: String, key: String },
}

impl CacheError {
    pub fn origin_unavailable(cache: &str, key: &str, source: &OriginError) -> Self {
        Self::OriginUnavailable {
            cache: cache.to_string(),
            key: key.to_string(),
            message: source.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::OriginUnavailable { key, .. } | Self::RefreshAborted { key, .. } => key,
        }
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently in the cache.
    pub size: usize,
    /// Lookups answered from a Fresh entry.
    pub hits: u64,
    /// Lookups answered from a Stale entry.
    pub stale_hits: u64,
    /// Lookups that had to wait on the origin.
    pub misses: u64,
    /// Origin refreshes started.
    pub refreshes: u64,
    /// Origin refreshes that failed.
    pub refresh_errors: u64,
    /// Entries dropped to respect the size bound.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage, counting stale hits as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            (served as f64 / total as f64) * 100.0
        }
    }
}

/// Cache surface used by invalidation and warming.
#[async_trait]
pub trait Cache<T>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<T>, CacheError>;

    fn set(&self, key: &str, value: T);

    fn remove(&self, key: &str);

    fn stats(&self) -> CacheStats;
}

#[async_trait]
impl<T> Cache<T> for FreshnessCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<T>, CacheError> {
        FreshnessCache::get(self, key).await
    }

    fn set(&self, key: &str, value: T) {
        FreshnessCache::set(self, key, value)
    }

    fn remove(&self, key: &str) {
        FreshnessCache::remove(self, key)
    }

    fn stats(&self) -> CacheStats {
        FreshnessCache::stats(self)
    }
}

/// Cache that stores nothing and always misses.
pub struct NoopCache<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> NoopCache<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NoopCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Cache<T> for NoopCache<T>
where
    T: Send + 'static,
{
    async fn get(&self, _key: &str) -> Result<Option<T>, CacheError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: T) {}

    fn remove(&self, _key: &str) {}

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}
