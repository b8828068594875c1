//! Dual-tier rate limiting.
//!
//! ## Tiers
//!
//! - **Local** ([`InMemoryRatelimiter`]): per-node counters, never waits on I/O.
//!   With N nodes a caller can be admitted up to N times the limit.
//! - **Distributed** ([`RedisRatelimiter`]): one shared counter per identity,
//!   atomically incremented in Redis. Redis is the only arbiter, so the limit
//!   holds fleet-wide at the cost of a network round-trip.
//!
//! Both tiers use a fixed window that starts at the first request seen for an
//! identity and lasts `window`. A request names the [`Consistency`] it needs
//! and [`DualTierRatelimiter`] routes it.

mod distributed;
mod memory;

pub use distributed::{RATELIMIT_SCRIPT, RedisRatelimiter};
pub use memory::InMemoryRatelimiter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyguard_core::{KeyRatelimit, RatelimitKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// One admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatelimitRequest {
    /// Who is being limited, usually a key id.
    pub identifier: String,
    /// Units admitted per window.
    pub limit: u64,
    pub window: Duration,
    /// Units this request consumes.
    pub cost: u64,
}

impl RatelimitRequest {
    pub fn new(identifier: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            identifier: identifier.into(),
            limit,
            window,
            cost: 1,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Build the request for a key's own configured limit.
    pub fn for_key(key_id: &str, ratelimit: &KeyRatelimit) -> Self {
        Self::new(
            key_id,
            ratelimit.limit,
            Duration::from_millis(ratelimit.window_ms),
        )
    }

    pub(crate) fn validate(&self) -> Result<(), RatelimitError> {
        if self.identifier.is_empty() {
            return Err(RatelimitError::invalid("identifier must not be empty"));
        }
        if self.window.is_zero() {
            return Err(RatelimitError::invalid("window must be > 0"));
        }
        Ok(())
    }

    pub(crate) fn window_ms(&self) -> u64 {
        self.window.as_millis().max(1) as u64
    }
}

/// Outcome of an admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatelimitResponse {
    pub pass: bool,
    /// Units still available in the current window.
    pub remaining: u64,
    pub limit: u64,
    /// Time until the current window closes.
    pub reset_after: Duration,
    /// Wall-clock time the current window closes.
    pub reset_at: OffsetDateTime,
}

impl RatelimitResponse {
    pub(crate) fn new(pass: bool, remaining: u64, limit: u64, reset_after: Duration) -> Self {
        Self {
            pass,
            remaining,
            limit,
            reset_after,
            reset_at: OffsetDateTime::now_utc() + reset_after,
        }
    }
}

/// Errors that can occur while rate limiting.
#[derive(Debug, Error)]
pub enum RatelimitError {
    #[error("Invalid rate limit request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit backend error for {identifier}: {message}")]
    Backend { identifier: String, message: String },
}

impl RatelimitError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// What the distributed tier answers when its backend cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendFailurePolicy {
    /// Admit the request.
    #[default]
    FailOpen,
    /// Reject the request.
    FailClosed,
}

impl BackendFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendFailurePolicy::FailOpen => "fail_open",
            BackendFailurePolicy::FailClosed => "fail_closed",
        }
    }

    /// The response handed out in place of a backend answer.
    pub fn fallback(&self, req: &RatelimitRequest) -> RatelimitResponse {
        match self {
            BackendFailurePolicy::FailOpen => {
                RatelimitResponse::new(true, req.limit, req.limit, req.window)
            }
            BackendFailurePolicy::FailClosed => {
                RatelimitResponse::new(false, 0, req.limit, req.window)
            }
        }
    }
}

impl std::fmt::Display for BackendFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single rate limiting tier.
#[async_trait]
pub trait Ratelimiter: Send + Sync {
    async fn take(&self, req: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError>;

    /// Short tier name used in logs and metrics.
    fn tier(&self) -> &'static str;
}

/// Limiter that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRatelimiter;

#[async_trait]
impl Ratelimiter for NoopRatelimiter {
    async fn take(&self, req: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError> {
        Ok(RatelimitResponse::new(
            true,
            req.limit,
            req.limit,
            Duration::ZERO,
        ))
    }

    fn tier(&self) -> &'static str {
        "noop"
    }
}

/// Consistency a request needs from the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Consistency {
    /// Node-local counter is good enough.
    #[default]
    Fast,
    /// Counter shared by every node.
    Global,
}

impl From<RatelimitKind> for Consistency {
    fn from(kind: RatelimitKind) -> Self {
        match kind {
            RatelimitKind::Fast => Consistency::Fast,
            RatelimitKind::Consistent => Consistency::Global,
        }
    }
}

/// Routes requests to the local or distributed tier by consistency.
///
/// Without a distributed tier, `Global` requests are served locally.
#[derive(Clone)]
pub struct DualTierRatelimiter {
    local: Arc<dyn Ratelimiter>,
    global: Option<Arc<dyn Ratelimiter>>,
}

impl DualTierRatelimiter {
    pub fn new(local: Arc<dyn Ratelimiter>, global: Option<Arc<dyn Ratelimiter>>) -> Self {
        Self { local, global }
    }

    pub fn local_only(local: Arc<dyn Ratelimiter>) -> Self {
        Self::new(local, None)
    }

    pub fn has_global_tier(&self) -> bool {
        self.global.is_some()
    }

    pub async fn take(
        &self,
        req: &RatelimitRequest,
        consistency: Consistency,
    ) -> Result<RatelimitResponse, RatelimitError> {
        let limiter = match (consistency, &self.global) {
            (Consistency::Global, Some(global)) => global,
            _ => &self.local,
        };

        let response = limiter.take(req).await?;
        crate::metrics::record_ratelimit_decision(limiter.tier(), response.pass);
        if !response.pass {
            tracing::debug!(
                identifier = %req.identifier,
                tier = limiter.tier(),
                limit = req.limit,
                reset_after_ms = response.reset_after.as_millis() as u64,
                "rate limit exceeded"
            );
        }
        Ok(response)
    }
}
