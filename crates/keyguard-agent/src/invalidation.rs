//! Keeps node caches coherent with the origin by reacting to key events.
//!
//! - **Deleted**: the Key entry is removed by hash. The Api entry stays; other
//!   keys of the same Api still need it.
//! - **Created / Updated**: the Key is re-read from the origin by id and
//!   installed by hash, then its Api is re-read by `key_auth_id` and
//!   installed too.
//!
//! Both paths are idempotent, so redelivered or replayed events are harmless.
//! A stale refresh racing a delete may put the Key back until its next
//! revalidation; origin reads will then miss and drop it.

use std::sync::Arc;

use async_trait::async_trait;
use keyguard_core::{Api, Key, KeyEvent, KeyEventType, OriginError, OriginStore};
use thiserror::Error;

use crate::cache::Cache;
use crate::events::{HandlerError, KeyEventHandler};

/// Errors that make an event worth delivering again.
#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("failed to load key {key_id} from origin: {source}")]
    KeyLookup {
        key_id: String,
        #[source]
        source: OriginError,
    },

    #[error("failed to load api for key auth {key_auth_id} from origin: {source}")]
    ApiLookup {
        key_auth_id: String,
        #[source]
        source: OriginError,
    },
}

impl From<InvalidationError> for HandlerError {
    fn from(e: InvalidationError) -> Self {
        HandlerError::new(e.to_string())
    }
}

/// Applies key events to the Key and Api caches.
pub struct KeyInvalidator {
    origin: Arc<dyn OriginStore>,
    keys: Arc<dyn Cache<Key>>,
    apis: Arc<dyn Cache<Api>>,
}

impl KeyInvalidator {
    pub fn new(
        origin: Arc<dyn OriginStore>,
        keys: Arc<dyn Cache<Key>>,
        apis: Arc<dyn Cache<Api>>,
    ) -> Self {
        Self { origin, keys, apis }
    }

    pub async fn apply(&self, event: &KeyEvent) -> Result<(), InvalidationError> {
        let result = match event.event_type {
            KeyEventType::Deleted => {
                self.keys.remove(&event.key.hash);
                tracing::info!(key_id = %event.key.id, key_hash = %event.key.hash, "evicted deleted key");
                Ok(())
            }
            KeyEventType::Created | KeyEventType::Updated => self.precache(event).await,
        };

        let outcome = if result.is_ok() { "ok" } else { "error" };
        crate::metrics::record_invalidation(event.event_type.as_str(), outcome);
        result
    }

    /// Load the key and its Api from the origin and install both.
    ///
    /// A hash carried by the event that no longer matches the origin is
    /// evicted, so a rotated key stops resolving under its old hash.
    async fn precache(&self, event: &KeyEvent) -> Result<(), InvalidationError> {
        let key_id = event.key.id.as_str();
        let key = self
            .origin
            .find_key_by_id(key_id)
            .await
            .map_err(|source| InvalidationError::KeyLookup {
                key_id: key_id.to_string(),
                source,
            })?;

        let Some(key) = key else {
            tracing::debug!(key_id = %key_id, "key no longer at origin, nothing to precache");
            return Ok(());
        };

        if event.key.hash != key.hash {
            self.keys.remove(&event.key.hash);
            tracing::info!(key_id = %key_id, old_hash = %event.key.hash, "evicted rotated key hash");
        }

        let key_auth_id = key.key_auth_id.clone();
        let hash = key.hash.clone();
        self.keys.set(&hash, key);

        let api = self
            .origin
            .find_api_by_key_auth_id(&key_auth_id)
            .await
            .map_err(|source| InvalidationError::ApiLookup {
                key_auth_id: key_auth_id.clone(),
                source,
            })?;

        match api {
            Some(api) => {
                self.apis.set(&key_auth_id, api);
                tracing::info!(key_id = %key_id, key_auth_id = %key_auth_id, "precached key and api");
            }
            None => {
                tracing::warn!(key_id = %key_id, key_auth_id = %key_auth_id, "precached key has no api at origin");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyEventHandler for KeyInvalidator {
    async fn handle(&self, event: &KeyEvent) -> Result<(), HandlerError> {
        self.apply(event).await.map_err(HandlerError::from)
    }
}
