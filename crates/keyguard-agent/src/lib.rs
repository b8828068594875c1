pub mod agent;
pub mod cache;
pub mod config;
pub mod events;
pub mod invalidation;
pub mod metrics;
pub mod observability;
pub mod ratelimit;
pub mod warmer;

pub use agent::{Agent, AgentBuilder, AgentError, ResolvedKey};
pub use cache::{Cache, CacheError, CacheOptions, CacheStats, EntryState, FreshnessCache};
pub use config::{AgentConfig, RedisConfig};
pub use events::{EventBus, KeyEventHandler, LocalEventBus, NoopEventBus, RedisEventBus};
pub use invalidation::KeyInvalidator;
pub use ratelimit::{
    BackendFailurePolicy, Consistency, DualTierRatelimiter, RatelimitRequest, RatelimitResponse,
    Ratelimiter,
};
pub use warmer::{CacheWarmer, WarmStats};

/// Create a Redis connection pool from configuration.
///
/// No connection is opened here; the first checkout connects.
pub fn create_redis_pool(config: &RedisConfig) -> Result<deadpool_redis::Pool, AgentError> {
    use std::time::Duration;

    let timeout = Some(Duration::from_millis(config.timeout_ms));
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size.max(1));
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    redis_config.pool = Some(pool_config);

    redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| AgentError::Redis(format!("failed to create Redis pool: {e}")))
}
