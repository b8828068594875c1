//! Contract for the authoritative store of keys and Apis.
//!
//! Nodes never write to the origin; they read through it on cache misses and
//! page through it when warming. Implementations must return `Ok(None)` for a
//! missing entity and reserve `Err` for failures to answer.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::entities::{Api, Key};
use crate::error::OriginError;

#[async_trait]
pub trait OriginStore: Send + Sync {
    /// Look up a key by its hash.
    async fn find_key_by_hash(&self, hash: &str) -> Result<Option<Key>, OriginError>;

    /// Look up a key by its id.
    async fn find_key_by_id(&self, id: &str) -> Result<Option<Key>, OriginError>;

    /// Look up an Api by its id.
    async fn find_api(&self, api_id: &str) -> Result<Option<Api>, OriginError>;

    /// Look up the Api owning a key auth group.
    async fn find_api_by_key_auth_id(&self, key_auth_id: &str)
    -> Result<Option<Api>, OriginError>;

    /// Page through all Apis in a stable order.
    async fn list_apis(&self, limit: usize, offset: usize) -> Result<Vec<Api>, OriginError>;

    /// Page through the keys of one key auth group in a stable order.
    async fn list_keys(
        &self,
        key_auth_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Key>, OriginError>;
}

/// Origin store held entirely in memory.
///
/// Used for local development and tests. Can be switched into an unavailable
/// state to exercise failure paths, and counts lookups so callers can assert
/// how often the origin was consulted.
#[derive(Debug, Default)]
pub struct InMemoryOriginStore {
    keys: DashMap<String, Key>,
    apis: DashMap<String, Api>,
    unavailable: AtomicBool,
    lookups: AtomicU64,
}

impl InMemoryOriginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_key(&self, key: Key) {
        self.keys.insert(key.id.clone(), key);
    }

    pub fn remove_key(&self, id: &str) -> Option<Key> {
        self.keys.remove(id).map(|(_, key)| key)
    }

    pub fn insert_api(&self, api: Api) {
        self.apis.insert(api.id.clone(), api);
    }

    pub fn remove_api(&self, id: &str) -> Option<Api> {
        self.apis.remove(id).map(|(_, api)| api)
    }

    /// Make every subsequent call fail with `OriginError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of single-entity lookups served so far.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), OriginError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OriginError::unavailable("in-memory origin switched off"));
        }
        Ok(())
    }

    fn record_lookup(&self) -> Result<(), OriginError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }
}

#[async_trait]
impl OriginStore for InMemoryOriginStore {
    async fn find_key_by_hash(&self, hash: &str) -> Result<Option<Key>, OriginError> {
        self.record_lookup()?;
        Ok(self
            .keys
            .iter()
            .find(|entry| entry.hash == hash)
            .map(|entry| entry.value().clone()))
    }

    async fn find_key_by_id(&self, id: &str) -> Result<Option<Key>, OriginError> {
        self.record_lookup()?;
        Ok(self.keys.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_api(&self, api_id: &str) -> Result<Option<Api>, OriginError> {
        self.record_lookup()?;
        Ok(self.apis.get(api_id).map(|entry| entry.value().clone()))
    }

    async fn find_api_by_key_auth_id(
        &self,
        key_auth_id: &str,
    ) -> Result<Option<Api>, OriginError> {
        self.record_lookup()?;
        Ok(self
            .apis
            .iter()
            .find(|entry| entry.key_auth_id == key_auth_id)
            .map(|entry| entry.value().clone()))
    }

    async fn list_apis(&self, limit: usize, offset: usize) -> Result<Vec<Api>, OriginError> {
        self.check_available()?;
        let mut apis: Vec<Api> = self.apis.iter().map(|e| e.value().clone()).collect();
        apis.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(apis.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_keys(
        &self,
        key_auth_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Key>, OriginError> {
        self.check_available()?;
        let mut keys: Vec<Key> = self
            .keys
            .iter()
            .filter(|e| e.key_auth_id == key_auth_id)
            .map(|e| e.value().clone())
            .collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(keys.into_iter().skip(offset).take(limit).collect())
    }
}
