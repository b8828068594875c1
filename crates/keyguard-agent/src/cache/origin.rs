//! Origin refresh capability used by freshness caches.
//!
//! A cache only needs one thing from the origin: "give me the current value
//! for this cache key, or tell me it does not exist". The adapters below
//! answer that question from an [`OriginStore`] for each cache keying.

use std::sync::Arc;

use async_trait::async_trait;
use keyguard_core::{Api, Key, OriginError, OriginStore};

/// Loads the authoritative value for a cache key.
#[async_trait]
pub trait OriginFetcher<T>: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<T>, OriginError>;
}

/// Resolves Keys by their hash.
#[derive(Clone)]
pub struct KeyByHash {
    origin: Arc<dyn OriginStore>,
}

impl KeyByHash {
    pub fn new(origin: Arc<dyn OriginStore>) -> Self {
        Self { origin }
    }
}

#[async_trait]
impl OriginFetcher<Key> for KeyByHash {
    async fn fetch(&self, hash: &str) -> Result<Option<Key>, OriginError> {
        self.origin.find_key_by_hash(hash).await
    }
}

/// Resolves Apis by the key auth group they own.
#[derive(Clone)]
pub struct ApiByKeyAuthId {
    origin: Arc<dyn OriginStore>,
}

impl ApiByKeyAuthId {
    pub fn new(origin: Arc<dyn OriginStore>) -> Self {
        Self { origin }
    }
}

#[async_trait]
impl OriginFetcher<Api> for ApiByKeyAuthId {
    async fn fetch(&self, key_auth_id: &str) -> Result<Option<Api>, OriginError> {
        self.origin.find_api_by_key_auth_id(key_auth_id).await
    }
}

/// Resolves Apis by id, for caches keyed by Api id.
#[derive(Clone)]
pub struct ApiById {
    origin: Arc<dyn OriginStore>,
}

impl ApiById {
    pub fn new(origin: Arc<dyn OriginStore>) -> Self {
        Self { origin }
    }
}

#[async_trait]
impl OriginFetcher<Api> for ApiById {
    async fn fetch(&self, api_id: &str) -> Result<Option<Api>, OriginError> {
        self.origin.find_api(api_id).await
    }
}
