//! One-shot bulk load of Apis and Keys into the node caches.
//!
//! Pages through every Api, installs it under its `key_auth_id`, then pages
//! through that Api's keys and installs each under its hash. A page that
//! cannot be read is logged and skipped; the pass carries on with the next
//! page. After [`MAX_CONSECUTIVE_FAILURES`] failed pages in a row the
//! enumeration in question is abandoned, so a dead origin still ends the pass.

use std::future::Future;
use std::sync::Arc;

use keyguard_core::{Api, Key, OriginStore};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::Cache;

/// Failed page reads in a row after which an enumeration gives up.
pub const MAX_CONSECUTIVE_FAILURES: usize = 3;

/// Counts from a warming pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmStats {
    pub apis: usize,
    pub keys: usize,
    /// Pages the origin failed to return.
    pub failed_pages: usize,
}

impl WarmStats {
    /// Returns the total number of entries installed.
    pub fn total(&self) -> usize {
        self.apis + self.keys
    }
}

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("cache warming cancelled after {} entries", partial.total())]
    Cancelled { partial: WarmStats },
}

/// Populates Key and Api caches from the origin.
pub struct CacheWarmer {
    origin: Arc<dyn OriginStore>,
    keys: Arc<dyn Cache<Key>>,
    apis: Arc<dyn Cache<Api>>,
    page_size: usize,
}

/// Drive `read` until it finishes or `cancel` turns true.
///
/// `None` means cancelled. A dropped sender can no longer cancel, so the
/// read then simply runs to completion.
async fn unless_cancelled<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    read: F,
) -> Option<F::Output> {
    let stop = *cancel.borrow();
    if stop {
        return None;
    }
    tokio::pin!(read);

    loop {
        tokio::select! {
            biased;

            out = &mut read => return Some(out),
            changed = cancel.changed() => {
                if changed.is_err() {
                    return Some(read.await);
                }
                let stop = *cancel.borrow();
                if stop {
                    return None;
                }
            }
        }
    }
}

impl CacheWarmer {
    pub fn new(
        origin: Arc<dyn OriginStore>,
        keys: Arc<dyn Cache<Key>>,
        apis: Arc<dyn Cache<Api>>,
        page_size: usize,
    ) -> Self {
        Self {
            origin,
            keys,
            apis,
            page_size: page_size.max(1),
        }
    }

    /// Run one warming pass.
    ///
    /// Every origin read is raced against `cancel`; once it reads true the
    /// pass stops at once and returns what was loaded so far.
    pub async fn warm(&self, mut cancel: watch::Receiver<bool>) -> Result<WarmStats, WarmError> {
        info!(page_size = self.page_size, "Starting cache warming");
        let mut stats = WarmStats::default();
        let mut api_offset = 0;
        let mut failures_in_row = 0;

        loop {
            let page = unless_cancelled(
                &mut cancel,
                self.origin.list_apis(self.page_size, api_offset),
            )
            .await;
            let apis = match page {
                None => return Err(self.cancelled(stats)),
                Some(Ok(apis)) => {
                    failures_in_row = 0;
                    apis
                }
                Some(Err(e)) => {
                    warn!(offset = api_offset, error = %e, "failed to list apis, skipping page");
                    crate::metrics::record_warm_failure("api");
                    stats.failed_pages += 1;
                    failures_in_row += 1;
                    if failures_in_row >= MAX_CONSECUTIVE_FAILURES {
                        warn!(failures_in_row, "origin keeps failing, stopping api enumeration");
                        break;
                    }
                    api_offset += self.page_size;
                    continue;
                }
            };
            let page_len = apis.len();

            for api in apis {
                let key_auth_id = api.key_auth_id.clone();
                self.apis.set(&key_auth_id, api);
                stats.apis += 1;
                crate::metrics::record_warmed("api", 1);

                self.warm_keys(&key_auth_id, &mut cancel, &mut stats).await?;
            }

            if page_len < self.page_size {
                break;
            }
            api_offset += page_len;
        }

        info!(
            apis = stats.apis,
            keys = stats.keys,
            failed_pages = stats.failed_pages,
            "Cache warming complete"
        );
        Ok(stats)
    }

    async fn warm_keys(
        &self,
        key_auth_id: &str,
        cancel: &mut watch::Receiver<bool>,
        stats: &mut WarmStats,
    ) -> Result<(), WarmError> {
        let mut offset = 0;
        let mut failures_in_row = 0;

        loop {
            let page = unless_cancelled(
                cancel,
                self.origin.list_keys(key_auth_id, self.page_size, offset),
            )
            .await;
            let keys = match page {
                None => return Err(self.cancelled(stats.clone())),
                Some(Ok(keys)) => {
                    failures_in_row = 0;
                    keys
                }
                Some(Err(e)) => {
                    warn!(key_auth_id = %key_auth_id, offset, error = %e, "failed to list keys, skipping page");
                    crate::metrics::record_warm_failure("key");
                    stats.failed_pages += 1;
                    failures_in_row += 1;
                    if failures_in_row >= MAX_CONSECUTIVE_FAILURES {
                        warn!(key_auth_id = %key_auth_id, failures_in_row, "origin keeps failing, skipping remaining keys");
                        return Ok(());
                    }
                    offset += self.page_size;
                    continue;
                }
            };
            let page_len = keys.len();

            for key in keys {
                let hash = key.hash.clone();
                self.keys.set(&hash, key);
            }
            stats.keys += page_len;
            crate::metrics::record_warmed("key", page_len);

            if page_len < self.page_size {
                return Ok(());
            }
            offset += page_len;
        }
    }

    fn cancelled(&self, partial: WarmStats) -> WarmError {
        info!(
            apis = partial.apis,
            keys = partial.keys,
            "Cache warming cancelled"
        );
        WarmError::Cancelled { partial }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use async_trait::async_trait;
    use keyguard_core::{InMemoryOriginStore, OriginError};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Records what was installed.
    struct RecordingCache<T> {
        entries: Mutex<HashMap<String, T>>,
    }

    impl<T> Default for RecordingCache<T> {
        fn default() -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> Cache<T> for RecordingCache<T> {
        async fn get(&self, key: &str) -> Result<Option<T>, crate::cache::CacheError> {
            Ok(self.entries.lock().get(key).cloned())
        }

        fn set(&self, key: &str, value: T) {
            self.entries.lock().insert(key.to_string(), value);
        }

        fn remove(&self, key: &str) {
            self.entries.lock().remove(key);
        }

        fn stats(&self) -> crate::cache::CacheStats {
            Default::default()
        }
    }

    fn seeded(apis: usize, keys_per_api: usize) -> Arc<InMemoryOriginStore> {
        let store = Arc::new(InMemoryOriginStore::new());
        for a in 0..apis {
            store.insert_api(Api::new(format!("api_{a}"), format!("ka_{a}")));
            for k in 0..keys_per_api {
                store.insert_key(Key::new(
                    format!("key_{a}_{k}"),
                    format!("hash_{a}_{k}"),
                    format!("ka_{a}"),
                ));
            }
        }
        store
    }

    #[tokio::test]
    async fn test_warms_every_api_and_key_across_pages() {
        let store = seeded(5, 7);
        let keys = Arc::new(RecordingCache::<Key>::default());
        let apis = Arc::new(RecordingCache::<Api>::default());
        let warmer = CacheWarmer::new(store, keys.clone(), apis.clone(), 3);

        let (_tx, rx) = watch::channel(false);
        let stats = warmer.warm(rx).await.unwrap();

        assert_eq!(stats.apis, 5);
        assert_eq!(stats.keys, 35);
        assert_eq!(stats.failed_pages, 0);
        assert_eq!(apis.entries.lock().len(), 5);
        assert_eq!(keys.entries.lock().get("hash_4_6").unwrap().id, "key_4_6");
        assert_eq!(apis.entries.lock().get("ka_2").unwrap().id, "api_2");
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reads_nothing() {
        let store = seeded(2, 2);
        let warmer = CacheWarmer::new(
            store,
            Arc::new(NoopCache::<Key>::new()),
            Arc::new(NoopCache::<Api>::new()),
            10,
        );

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = warmer.warm(rx).await.unwrap_err();
        let WarmError::Cancelled { partial } = err;
        assert_eq!(partial.total(), 0);
    }

    /// Origin with failures at chosen pages, an optional api listing that
    /// never answers, and a cancel signal flipped after some key pages.
    struct ScriptedOrigin {
        inner: Arc<InMemoryOriginStore>,
        failing_api_offsets: Vec<usize>,
        failing_key_pages: Vec<(String, usize)>,
        hang_api_listing: bool,
        cancel_after_key_pages: Option<(usize, watch::Sender<bool>)>,
        key_pages: Mutex<usize>,
    }

    impl ScriptedOrigin {
        fn over(inner: Arc<InMemoryOriginStore>) -> Self {
            Self {
                inner,
                failing_api_offsets: Vec::new(),
                failing_key_pages: Vec::new(),
                hang_api_listing: false,
                cancel_after_key_pages: None,
                key_pages: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl OriginStore for ScriptedOrigin {
        async fn find_key_by_hash(&self, hash: &str) -> Result<Option<Key>, OriginError> {
            self.inner.find_key_by_hash(hash).await
        }

        async fn find_key_by_id(&self, id: &str) -> Result<Option<Key>, OriginError> {
            self.inner.find_key_by_id(id).await
        }

        async fn find_api(&self, api_id: &str) -> Result<Option<Api>, OriginError> {
            self.inner.find_api(api_id).await
        }

        async fn find_api_by_key_auth_id(
            &self,
            key_auth_id: &str,
        ) -> Result<Option<Api>, OriginError> {
            self.inner.find_api_by_key_auth_id(key_auth_id).await
        }

        async fn list_apis(&self, limit: usize, offset: usize) -> Result<Vec<Api>, OriginError> {
            if self.hang_api_listing {
                std::future::pending::<()>().await;
            }
            if self.failing_api_offsets.contains(&offset) {
                return Err(OriginError::unavailable("replica lagging"));
            }
            self.inner.list_apis(limit, offset).await
        }

        async fn list_keys(
            &self,
            key_auth_id: &str,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<Key>, OriginError> {
            if self
                .failing_key_pages
                .iter()
                .any(|(id, at)| id == key_auth_id && *at == offset)
            {
                return Err(OriginError::unavailable("replica lagging"));
            }
            let served = {
                let mut pages = self.key_pages.lock();
                *pages += 1;
                *pages
            };
            if let Some((after, tx)) = &self.cancel_after_key_pages {
                if served >= *after {
                    let _ = tx.send(true);
                }
            }
            self.inner.list_keys(key_auth_id, limit, offset).await
        }
    }

    #[tokio::test]
    async fn test_failed_api_page_is_skipped_and_pass_continues() {
        let mut origin = ScriptedOrigin::over(seeded(5, 1));
        origin.failing_api_offsets = vec![1];
        let apis = Arc::new(RecordingCache::<Api>::default());
        let warmer = CacheWarmer::new(
            Arc::new(origin),
            Arc::new(NoopCache::<Key>::new()),
            apis.clone(),
            1,
        );

        let (_tx, rx) = watch::channel(false);
        let stats = warmer.warm(rx).await.unwrap();

        assert_eq!(stats.apis, 4);
        assert_eq!(stats.keys, 4);
        assert_eq!(stats.failed_pages, 1);
        assert!(apis.entries.lock().get("ka_1").is_none());
        assert!(apis.entries.lock().get("ka_4").is_some());
    }

    #[tokio::test]
    async fn test_failed_key_page_is_skipped_and_next_page_loaded() {
        let mut origin = ScriptedOrigin::over(seeded(2, 5));
        origin.failing_key_pages = vec![("ka_0".to_string(), 2)];
        let keys = Arc::new(RecordingCache::<Key>::default());
        let warmer = CacheWarmer::new(
            Arc::new(origin),
            keys.clone(),
            Arc::new(NoopCache::<Api>::new()),
            2,
        );

        let (_tx, rx) = watch::channel(false);
        let stats = warmer.warm(rx).await.unwrap();

        assert_eq!(stats.apis, 2);
        // Keys 2 and 3 of ka_0 sat on the failed page.
        assert_eq!(stats.keys, 8);
        assert_eq!(stats.failed_pages, 1);
        assert!(keys.entries.lock().get("hash_0_4").is_some());
        assert!(keys.entries.lock().get("hash_0_2").is_none());
    }

    #[tokio::test]
    async fn test_dead_origin_ends_pass_after_consecutive_failures() {
        let store = seeded(2, 2);
        store.set_unavailable(true);
        let warmer = CacheWarmer::new(
            store,
            Arc::new(NoopCache::<Key>::new()),
            Arc::new(NoopCache::<Api>::new()),
            10,
        );

        let (_tx, rx) = watch::channel(false);
        let stats = warmer.warm(rx).await.unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(stats.failed_pages, MAX_CONSECUTIVE_FAILURES);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hung_origin_read() {
        let mut origin = ScriptedOrigin::over(seeded(1, 1));
        origin.hang_api_listing = true;
        let warmer = CacheWarmer::new(
            Arc::new(origin),
            Arc::new(NoopCache::<Key>::new()),
            Arc::new(NoopCache::<Api>::new()),
            10,
        );

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { warmer.warm(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("warm must return once cancelled")
            .unwrap();
        let WarmError::Cancelled { partial } = result.unwrap_err();
        assert_eq!(partial.total(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_does_not_cancel() {
        let store = seeded(2, 2);
        let warmer = CacheWarmer::new(
            store,
            Arc::new(NoopCache::<Key>::new()),
            Arc::new(NoopCache::<Api>::new()),
            10,
        );

        let (tx, rx) = watch::channel(false);
        drop(tx);
        let stats = warmer.warm(rx).await.unwrap();
        assert_eq!(stats.total(), 6);
    }

    #[tokio::test]
    async fn test_cancel_mid_pass_stops_further_reads() {
        let (tx, rx) = watch::channel(false);
        let mut origin = ScriptedOrigin::over(seeded(4, 1));
        origin.cancel_after_key_pages = Some((2, tx));
        let origin = Arc::new(origin);
        let warmer = CacheWarmer::new(
            origin.clone(),
            Arc::new(NoopCache::<Key>::new()),
            Arc::new(NoopCache::<Api>::new()),
            10,
        );

        let WarmError::Cancelled { partial } = warmer.warm(rx).await.unwrap_err();
        assert_eq!(partial.apis, 3);
        assert_eq!(partial.keys, 2);
        assert_eq!(*origin.key_pages.lock(), 2);
    }
}
