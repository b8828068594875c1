//! Fleet-wide fixed window limiter backed by Redis.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;

use super::{
    BackendFailurePolicy, RatelimitError, RatelimitRequest, RatelimitResponse, Ratelimiter,
};

/// Atomically charge a window counter and report its state.
///
/// KEYS[1] = window counter, ARGV[1] = cost, ARGV[2] = limit, ARGV[3] = window ms.
/// The expiry is set when the counter is created, so the window starts at the
/// first request. A rejected request is not charged. Returns `{admitted, count, pttl}`.
pub const RATELIMIT_SCRIPT: &str = r#"
local cost = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local window = tonumber(ARGV[3])

local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local admitted = 0
if current + cost <= limit then
    current = redis.call('INCRBY', KEYS[1], cost)
    admitted = 1
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    if current > 0 then
        redis.call('PEXPIRE', KEYS[1], window)
    end
    ttl = window
end

return {admitted, current, ttl}
"#;

/// Rate limiter whose counters live in Redis and are shared by every node.
///
/// When Redis cannot be reached the configured [`BackendFailurePolicy`]
/// decides the answer, and the failure is logged and counted.
pub struct RedisRatelimiter {
    pool: Pool,
    key_prefix: String,
    on_failure: BackendFailurePolicy,
    script: redis::Script,
}

impl RedisRatelimiter {
    pub fn new(
        pool: Pool,
        key_prefix: impl Into<String>,
        on_failure: BackendFailurePolicy,
    ) -> Self {
        Self {
            pool,
            key_prefix: key_prefix.into(),
            on_failure,
            script: redis::Script::new(RATELIMIT_SCRIPT),
        }
    }

    pub fn failure_policy(&self) -> BackendFailurePolicy {
        self.on_failure
    }

    fn counter_key(&self, req: &RatelimitRequest) -> String {
        format!("{}:{}:{}", self.key_prefix, req.identifier, req.window_ms())
    }

    async fn charge(&self, req: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError> {
        let backend_err = |message: String| RatelimitError::Backend {
            identifier: req.identifier.clone(),
            message,
        };

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| backend_err(format!("failed to get Redis connection: {e}")))?;

        let (admitted, count, ttl_ms): (i64, i64, i64) = self
            .script
            .key(self.counter_key(req))
            .arg(req.cost)
            .arg(req.limit)
            .arg(req.window_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_err(format!("rate limit script failed: {e}")))?;

        let count = count.max(0) as u64;
        Ok(RatelimitResponse::new(
            admitted == 1,
            req.limit.saturating_sub(count),
            req.limit,
            Duration::from_millis(ttl_ms.max(0) as u64),
        ))
    }
}

#[async_trait]
impl Ratelimiter for RedisRatelimiter {
    async fn take(&self, req: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError> {
        req.validate()?;

        match self.charge(req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::warn!(
                    identifier = %req.identifier,
                    policy = %self.on_failure,
                    error = %e,
                    "distributed rate limiter unavailable, applying failure policy"
                );
                crate::metrics::record_ratelimit_backend_failure(self.on_failure.as_str());
                Ok(self.on_failure.fallback(req))
            }
        }
    }

    fn tier(&self) -> &'static str {
        "distributed"
    }
}
