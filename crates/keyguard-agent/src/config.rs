use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::ratelimit::BackendFailurePolicy;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Key and Api cache configuration
    #[serde(default)]
    pub cache: CachesConfig,
    #[serde(default)]
    pub ratelimit: RatelimitConfig,
    /// Redis configuration (distributed limiter, Redis event bus)
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub warmer: WarmerConfig,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Cache validations
        self.cache.key.validate("cache.key")?;
        self.cache.api.validate("cache.api")?;
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Redis-backed features
        let needs_redis =
            self.ratelimit.enable_distributed || self.event_bus.kind == EventBusKind::Redis;
        if needs_redis {
            if self.redis.url.trim().is_empty() {
                return Err("redis.url is required when a Redis-backed feature is enabled".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
        }
        if self.event_bus.kind == EventBusKind::Redis && self.node.id.trim().is_empty() {
            return Err("node.id is required for the redis event bus".into());
        }
        if self.event_bus.kind == EventBusKind::Local && self.event_bus.max_local_attempts == 0 {
            return Err("event_bus.max_local_attempts must be > 0".into());
        }
        // Warmer validation
        if self.warmer.page_size == 0 {
            return Err("warmer.page_size must be > 0".into());
        }
        Ok(())
    }
}

/// Identity of this node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique per node; names the node's Redis consumer group
    #[serde(default = "default_node_id")]
    pub id: String,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_node_id() -> String {
    "local".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "CachesInput")]
pub struct CachesConfig {
    /// Keys, cached by hash
    pub key: CacheConfig,
    /// Apis, cached by key auth id
    pub api: CacheConfig,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            key: default_key_cache(),
            api: default_api_cache(),
        }
    }
}

fn default_key_cache() -> CacheConfig {
    CacheConfig {
        fresh_secs: 15 * 60,
        stale_secs: 60 * 60,
        ..CacheConfig::default()
    }
}

fn default_api_cache() -> CacheConfig {
    CacheConfig {
        fresh_secs: 5 * 60,
        stale_secs: 15 * 60,
        ..CacheConfig::default()
    }
}

/// `[cache]` as written; each section fills its gaps from its own defaults.
#[derive(Deserialize)]
struct CachesInput {
    #[serde(default)]
    key: CacheSectionInput,
    #[serde(default)]
    api: CacheSectionInput,
}

impl From<CachesInput> for CachesConfig {
    fn from(input: CachesInput) -> Self {
        Self {
            key: input.key.resolve(default_key_cache()),
            api: input.api.resolve(default_api_cache()),
        }
    }
}

#[derive(Default, Deserialize)]
struct CacheSectionInput {
    fresh_secs: Option<u64>,
    stale_secs: Option<u64>,
    max_size: Option<usize>,
    origin_timeout_ms: Option<u64>,
    janitor_interval_secs: Option<u64>,
}

impl CacheSectionInput {
    fn resolve(self, defaults: CacheConfig) -> CacheConfig {
        CacheConfig {
            fresh_secs: self.fresh_secs.unwrap_or(defaults.fresh_secs),
            stale_secs: self.stale_secs.unwrap_or(defaults.stale_secs),
            max_size: self.max_size.unwrap_or(defaults.max_size),
            origin_timeout_ms: self.origin_timeout_ms.unwrap_or(defaults.origin_timeout_ms),
            janitor_interval_secs: self
                .janitor_interval_secs
                .unwrap_or(defaults.janitor_interval_secs),
        }
    }
}

/// Freshness cache settings for one section of `[cache]`
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    /// Entries younger than this are served without an origin check
    pub fresh_secs: u64,
    /// Entries at least this old are never served
    pub stale_secs: u64,
    pub max_size: usize,
    /// Upper bound on one origin lookup
    pub origin_timeout_ms: u64,
    /// How often expired entries are pruned; 0 disables the janitor
    pub janitor_interval_secs: u64,
}

fn default_max_size() -> usize {
    1024 * 1024
}

fn default_origin_timeout_ms() -> u64 {
    5000
}

fn default_janitor_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_secs: 15 * 60,
            stale_secs: 60 * 60,
            max_size: default_max_size(),
            origin_timeout_ms: default_origin_timeout_ms(),
            janitor_interval_secs: default_janitor_interval_secs(),
        }
    }
}

impl CacheConfig {
    fn validate(&self, section: &str) -> Result<(), String> {
        if self.fresh_secs >= self.stale_secs {
            return Err(format!("{section}.fresh_secs must be < {section}.stale_secs"));
        }
        if self.max_size == 0 {
            return Err(format!("{section}.max_size must be > 0"));
        }
        if self.origin_timeout_ms == 0 {
            return Err(format!("{section}.origin_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn options(&self) -> CacheOptions {
        CacheOptions::new(
            Duration::from_secs(self.fresh_secs),
            Duration::from_secs(self.stale_secs),
            self.max_size,
        )
        .with_origin_timeout(Duration::from_millis(self.origin_timeout_ms))
    }

    pub fn janitor_interval(&self) -> Option<Duration> {
        (self.janitor_interval_secs > 0).then(|| Duration::from_secs(self.janitor_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatelimitConfig {
    /// Serve `Global` requests from Redis instead of the local counters
    #[serde(default)]
    pub enable_distributed: bool,
    #[serde(default)]
    pub on_backend_failure: BackendFailurePolicy,
    #[serde(default = "default_ratelimit_prefix")]
    pub key_prefix: String,
    /// How often closed local windows are pruned; 0 disables the janitor
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
}

fn default_ratelimit_prefix() -> String {
    "keyguard:ratelimit".to_string()
}

impl Default for RatelimitConfig {
    fn default() -> Self {
        Self {
            enable_distributed: false,
            on_backend_failure: BackendFailurePolicy::default(),
            key_prefix: default_ratelimit_prefix(),
            janitor_interval_secs: default_janitor_interval_secs(),
        }
    }
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventBusKind {
    /// No invalidation events; caches rely on revalidation alone
    #[default]
    None,
    /// In-process channel
    Local,
    /// Redis Streams
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default)]
    pub kind: EventBusKind,
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Approximate number of entries the stream retains
    #[serde(default = "default_stream_max_len")]
    pub max_len: usize,
    /// How long one stream read waits for new entries
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Delay before a failed event is delivered again
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Deliveries of one event on the local bus before it is dropped
    #[serde(default = "default_max_local_attempts")]
    pub max_local_attempts: u32,
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
}

fn default_stream() -> String {
    "keyguard:key-events".to_string()
}

fn default_stream_max_len() -> usize {
    100_000
}

fn default_block_ms() -> u64 {
    5000
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_max_local_attempts() -> u32 {
    5
}

fn default_local_capacity() -> usize {
    1024
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            kind: EventBusKind::default(),
            stream: default_stream(),
            max_len: default_stream_max_len(),
            block_ms: default_block_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_local_attempts: default_max_local_attempts(),
            local_capacity: default_local_capacity(),
        }
    }
}

/// Cache warming on startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    500
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            page_size: default_page_size(),
        }
    }
}

pub mod loader {
    use super::AgentConfig;
    use config::{Config, Environment, File};
    use std::path::Path;

    pub const DEFAULT_CONFIG_PATH: &str = "keyguard.toml";

    /// Read `path` (default `keyguard.toml`) when it exists, apply
    /// `KEYGUARD__SECTION__FIELD` overrides and validate the result.
    pub fn load_config(path: Option<&str>) -> Result<AgentConfig, String> {
        let path = Path::new(path.unwrap_or(DEFAULT_CONFIG_PATH));
        let mut builder = Config::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        let cfg = builder
            .add_source(
                Environment::with_prefix("KEYGUARD")
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AgentConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
