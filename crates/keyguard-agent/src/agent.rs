//! Composition root for one edge node.
//!
//! [`AgentBuilder`] turns an [`AgentConfig`] and an origin store into a
//! running [`Agent`]: both caches, the event bus with the invalidation
//! handler registered, the rate limiter tiers, the optional warming pass and
//! the janitors. Every background task observes one shutdown channel, and
//! [`Agent::shutdown`] waits for all of them.

use std::sync::Arc;
use std::time::Duration;

use keyguard_core::{Api, Key, OriginStore};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::cache::{ApiByKeyAuthId, CacheError, FreshnessCache, KeyByHash};
use crate::config::{AgentConfig, EventBusKind};
use crate::events::{EventBus, EventBusError, LocalEventBus, NoopEventBus, RedisEventBusBuilder};
use crate::invalidation::KeyInvalidator;
use crate::observability::node_span;
use crate::ratelimit::{
    Consistency, DualTierRatelimiter, InMemoryRatelimiter, RatelimitError, RatelimitRequest,
    RatelimitResponse, Ratelimiter, RedisRatelimiter,
};
use crate::warmer::{CacheWarmer, WarmError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Origin store is required")]
    MissingOrigin,

    #[error("Redis error: {0}")]
    Redis(String),

    #[error(transparent)]
    EventBus(#[from] EventBusError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Ratelimit(#[from] RatelimitError),
}

/// A key together with the Api that owns it.
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub key: Key,
    pub api: Api,
}

pub struct AgentBuilder {
    config: AgentConfig,
    origin: Option<Arc<dyn OriginStore>>,
    event_bus: Option<Arc<dyn EventBus>>,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            origin: None,
            event_bus: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_origin(mut self, origin: Arc<dyn OriginStore>) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Use this bus instead of the one `event_bus.kind` selects.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub async fn build(self) -> Result<Agent, AgentError> {
        let config = self.config;
        config.validate().map_err(AgentError::Config)?;
        let origin = self.origin.ok_or(AgentError::MissingOrigin)?;
        let span = node_span(&config.node);

        let keys: FreshnessCache<Key> = FreshnessCache::new(
            "keys",
            config.cache.key.options(),
            Arc::new(KeyByHash::new(origin.clone())),
        );
        let apis: FreshnessCache<Api> = FreshnessCache::new(
            "apis",
            config.cache.api.options(),
            Arc::new(ApiByKeyAuthId::new(origin.clone())),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        if let Some(interval) = config.cache.key.janitor_interval() {
            tasks.push(keys.spawn_janitor(interval, shutdown_rx.clone()));
        }
        if let Some(interval) = config.cache.api.janitor_interval() {
            tasks.push(apis.spawn_janitor(interval, shutdown_rx.clone()));
        }

        let needs_redis = config.ratelimit.enable_distributed
            || (self.event_bus.is_none() && config.event_bus.kind == EventBusKind::Redis);
        let pool = if needs_redis {
            Some(connect_redis(&config).await?)
        } else {
            None
        };

        // Rate limiter tiers
        let local = Arc::new(InMemoryRatelimiter::new());
        if config.ratelimit.janitor_interval_secs > 0 {
            tasks.push(local.spawn_janitor(
                Duration::from_secs(config.ratelimit.janitor_interval_secs),
                shutdown_rx.clone(),
            ));
        }
        let distributed = config.ratelimit.enable_distributed;
        let global: Option<Arc<dyn Ratelimiter>> = match (&pool, distributed) {
            (Some(pool), true) => Some(Arc::new(RedisRatelimiter::new(
                pool.clone(),
                config.ratelimit.key_prefix.clone(),
                config.ratelimit.on_backend_failure,
            ))),
            _ => None,
        };
        let ratelimiter = DualTierRatelimiter::new(local, global);

        // Event bus with the invalidation handler
        let event_bus: Arc<dyn EventBus> = match (self.event_bus, config.event_bus.kind) {
            (Some(bus), _) => bus,
            (None, EventBusKind::None) => Arc::new(NoopEventBus),
            (None, EventBusKind::Local) => Arc::new(LocalEventBus::new(
                config.event_bus.local_capacity,
                config.event_bus.max_local_attempts,
                Duration::from_millis(config.event_bus.retry_backoff_ms),
            )),
            (None, EventBusKind::Redis) => {
                let pool = pool
                    .clone()
                    .ok_or_else(|| AgentError::Redis("Redis pool was not created".to_string()))?;
                Arc::new(
                    RedisEventBusBuilder::new()
                        .with_pool(pool)
                        .with_redis_url(config.redis.url.clone())
                        .with_stream(config.event_bus.stream.clone())
                        .with_node_id(config.node.id.clone())
                        .with_max_len(config.event_bus.max_len)
                        .with_block(Duration::from_millis(config.event_bus.block_ms))
                        .with_retry_backoff(Duration::from_millis(
                            config.event_bus.retry_backoff_ms,
                        ))
                        .build()?,
                )
            }
        };
        event_bus.on_key_event(Arc::new(KeyInvalidator::new(
            origin.clone(),
            Arc::new(keys.clone()),
            Arc::new(apis.clone()),
        )));
        tasks.push(event_bus.clone().start(shutdown_rx.clone()));

        if config.warmer.enabled {
            let warmer = CacheWarmer::new(
                origin,
                Arc::new(keys.clone()),
                Arc::new(apis.clone()),
                config.warmer.page_size,
            );
            let cancel = shutdown_rx.clone();
            tasks.push(tokio::spawn(
                async move {
                    match warmer.warm(cancel).await {
                        Ok(stats) => {
                            tracing::info!(entries = stats.total(), "caches warmed");
                        }
                        Err(WarmError::Cancelled { partial }) => {
                            tracing::info!(
                                entries = partial.total(),
                                "cache warming interrupted by shutdown"
                            );
                        }
                    }
                }
                .instrument(span.clone()),
            ));
        }

        span.in_scope(|| {
            tracing::info!(
                event_bus = event_bus.kind(),
                distributed_ratelimit = ratelimiter.has_global_tier(),
                warmer = config.warmer.enabled,
                "Agent started"
            );
        });

        Ok(Agent {
            config,
            keys,
            apis,
            ratelimiter,
            event_bus,
            shutdown_tx,
            tasks,
        })
    }
}

/// Create the pool and check it once; an unreachable Redis is logged, not
/// fatal, so the limiter's failure policy decides what happens later.
async fn connect_redis(config: &AgentConfig) -> Result<deadpool_redis::Pool, AgentError> {
    tracing::info!(url = %config.redis.url, "Connecting to Redis");
    let pool = crate::create_redis_pool(&config.redis)?;
    match pool.get().await {
        Ok(_) => tracing::info!("Connected to Redis"),
        Err(e) => tracing::warn!(error = %e, "Redis not reachable yet, continuing"),
    }
    Ok(pool)
}

/// A running edge node core.
pub struct Agent {
    config: AgentConfig,
    keys: FreshnessCache<Key>,
    apis: FreshnessCache<Api>,
    ratelimiter: DualTierRatelimiter,
    event_bus: Arc<dyn EventBus>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Keys by hash.
    pub fn keys(&self) -> &FreshnessCache<Key> {
        &self.keys
    }

    /// Apis by key auth id.
    pub fn apis(&self) -> &FreshnessCache<Api> {
        &self.apis
    }

    pub fn ratelimiter(&self) -> &DualTierRatelimiter {
        &self.ratelimiter
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.event_bus.clone()
    }

    /// Look up a key by hash and the Api owning it.
    ///
    /// `Ok(None)` when either is absent at the origin.
    pub async fn resolve(&self, hash: &str) -> Result<Option<ResolvedKey>, AgentError> {
        let Some(key) = self.keys.get(hash).await? else {
            return Ok(None);
        };
        let Some(api) = self.apis.get(&key.key_auth_id).await? else {
            tracing::warn!(key_id = %key.id, key_auth_id = %key.key_auth_id, "key has no api");
            return Ok(None);
        };
        Ok(Some(ResolvedKey { key, api }))
    }

    pub async fn take(
        &self,
        req: &RatelimitRequest,
        consistency: Consistency,
    ) -> Result<RatelimitResponse, AgentError> {
        Ok(self.ratelimiter.take(req, consistency).await?)
    }

    /// Apply the key's own rate limit, if it has one.
    pub async fn take_for_key(&self, key: &Key) -> Result<Option<RatelimitResponse>, AgentError> {
        let Some(ratelimit) = &key.ratelimit else {
            return Ok(None);
        };
        let req = RatelimitRequest::for_key(&key.id, ratelimit);
        let response = self.take(&req, ratelimit.kind.into()).await?;
        Ok(Some(response))
    }

    /// Signal every background task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!(node_id = %self.config.node.id, "Agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyguard_core::{InMemoryOriginStore, KeyRatelimit, RatelimitKind};

    fn seeded_origin() -> Arc<InMemoryOriginStore> {
        let store = Arc::new(InMemoryOriginStore::new());
        store.insert_api(Api::new("api_1", "ka_1"));
        store.insert_key(Key::new("key_1", "hash_1", "ka_1").with_ratelimit(KeyRatelimit {
            kind: RatelimitKind::Fast,
            limit: 2,
            window_ms: 60_000,
        }));
        store.insert_key(Key::new("orphan", "hash_orphan", "ka_missing"));
        store
    }

    #[tokio::test]
    async fn test_build_requires_origin() {
        let err = AgentBuilder::new().build().await.err().unwrap();
        assert!(matches!(err, AgentError::MissingOrigin));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = AgentConfig::default();
        config.warmer.page_size = 0;
        let err = AgentBuilder::new()
            .with_config(config)
            .with_origin(seeded_origin())
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Config(msg) if msg.contains("page_size")));
    }

    #[tokio::test]
    async fn test_resolve_and_key_ratelimit() {
        let agent = AgentBuilder::new()
            .with_origin(seeded_origin())
            .build()
            .await
            .unwrap();

        let resolved = agent.resolve("hash_1").await.unwrap().unwrap();
        assert_eq!(resolved.key.id, "key_1");
        assert_eq!(resolved.api.id, "api_1");
        assert!(agent.resolve("hash_unknown").await.unwrap().is_none());
        assert!(agent.resolve("hash_orphan").await.unwrap().is_none());

        let key = resolved.key;
        assert!(agent.take_for_key(&key).await.unwrap().unwrap().pass);
        assert!(agent.take_for_key(&key).await.unwrap().unwrap().pass);
        assert!(!agent.take_for_key(&key).await.unwrap().unwrap().pass);

        let unlimited = Key::new("key_2", "hash_2", "ka_1");
        assert!(agent.take_for_key(&unlimited).await.unwrap().is_none());

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_requests_use_local_tier_without_redis() {
        let agent = AgentBuilder::new()
            .with_origin(seeded_origin())
            .build()
            .await
            .unwrap();
        assert!(!agent.ratelimiter().has_global_tier());

        let req = RatelimitRequest::new("caller", 1, Duration::from_secs(10));
        assert!(agent.take(&req, Consistency::Global).await.unwrap().pass);
        assert!(!agent.take(&req, Consistency::Fast).await.unwrap().pass);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_warmer_runs_in_background() {
        let mut config = AgentConfig::default();
        config.warmer.enabled = true;
        let agent = AgentBuilder::new()
            .with_config(config)
            .with_origin(seeded_origin())
            .build()
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while agent.keys().is_empty() || agent.apis().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(agent.keys().peek("hash_1").is_some());

        agent.shutdown().await;
    }
}
