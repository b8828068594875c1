//! Node-local fixed window limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{RatelimitError, RatelimitRequest, RatelimitResponse, Ratelimiter};

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    length: Duration,
    count: u64,
}

impl Window {
    fn ends_at(&self) -> Instant {
        self.started_at + self.length
    }
}

/// Counts requests per identity and window length in process memory.
///
/// A window opens at the first request for an identity and closes `window`
/// later; the next request after that opens a new one. Counter updates hold
/// only the shard lock of one map entry.
#[derive(Debug, Default)]
pub struct InMemoryRatelimiter {
    windows: DashMap<String, Window>,
}

impl InMemoryRatelimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of windows currently tracked.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop windows that have closed. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.ends_at() > now);
        let removed = before.saturating_sub(self.windows.len());
        crate::metrics::set_ratelimit_windows(self.windows.len());
        removed
    }

    /// Run `prune_expired` every `interval` until `shutdown` flips to true.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.prune_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "pruned closed rate limit windows");
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            tracing::debug!("rate limit janitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn window_key(req: &RatelimitRequest) -> String {
        format!("{}:{}", req.identifier, req.window_ms())
    }
}

#[async_trait]
impl Ratelimiter for InMemoryRatelimiter {
    async fn take(&self, req: &RatelimitRequest) -> Result<RatelimitResponse, RatelimitError> {
        req.validate()?;
        let now = Instant::now();

        let mut window = self
            .windows
            .entry(Self::window_key(req))
            .or_insert(Window {
                started_at: now,
                length: req.window,
                count: 0,
            });

        if now >= window.ends_at() {
            window.started_at = now;
            window.length = req.window;
            window.count = 0;
        }

        let pass = window.count.saturating_add(req.cost) <= req.limit;
        if pass {
            window.count += req.cost;
        }
        let remaining = req.limit.saturating_sub(window.count);
        let reset_after = window.ends_at().saturating_duration_since(now);
        drop(window);

        Ok(RatelimitResponse::new(pass, remaining, req.limit, reset_after))
    }

    fn tier(&self) -> &'static str {
        "local"
    }
}
