//! Cache entries and their freshness tiers.

use std::time::Duration;
use tokio::time::Instant;

/// Freshness tier of a cached entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Served without consulting the origin.
    Fresh,
    /// Served, and a background revalidation is scheduled.
    Stale,
    /// Never served; the origin is consulted before answering.
    Expired,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Fresh => "fresh",
            EntryState::Stale => "stale",
            EntryState::Expired => "expired",
        }
    }

    /// Whether an entry in this state may be returned to a caller.
    pub fn is_servable(&self) -> bool {
        !matches!(self, EntryState::Expired)
    }
}

/// Tunables for one freshness cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Age below which an entry is Fresh.
    pub fresh: Duration,
    /// Age at which an entry becomes Expired. Values at or below `fresh`
    /// mean entries go straight from Fresh to Expired.
    pub stale: Duration,
    /// Upper bound on the number of entries held.
    pub max_size: usize,
    /// Upper bound on a single origin call made by a refresh.
    pub origin_timeout: Duration,
}

impl CacheOptions {
    pub fn new(fresh: Duration, stale: Duration, max_size: usize) -> Self {
        Self {
            fresh,
            stale,
            max_size,
            origin_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_origin_timeout(mut self, timeout: Duration) -> Self {
        self.origin_timeout = timeout;
        self
    }

    /// Classify an entry written at `written_at`.
    pub fn state_at(&self, written_at: Instant, now: Instant) -> EntryState {
        let age = now.saturating_duration_since(written_at);
        if age < self.fresh {
            EntryState::Fresh
        } else if age < self.stale {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }
}

/// A value together with when it was written and its place in write order.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<T> {
    pub(crate) value: T,
    pub(crate) written_at: Instant,
    pub(crate) seq: u64,
}

impl<T> CacheEntry<T> {
    pub(crate) fn new(value: T, written_at: Instant, seq: u64) -> Self {
        Self {
            value,
            written_at,
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_state_boundaries() {
        let opts = CacheOptions::new(Duration::from_secs(10), Duration::from_secs(30), 16);
        let written = Instant::now();

        assert_eq!(opts.state_at(written, written), EntryState::Fresh);
        assert_eq!(
            opts.state_at(written, written + Duration::from_millis(9_999)),
            EntryState::Fresh
        );
        assert_eq!(
            opts.state_at(written, written + Duration::from_secs(10)),
            EntryState::Stale
        );
        assert_eq!(
            opts.state_at(written, written + Duration::from_secs(30)),
            EntryState::Expired
        );
        assert!(!EntryState::Expired.is_servable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_not_above_fresh_skips_stale_tier() {
        let opts = CacheOptions::new(Duration::from_secs(10), Duration::from_secs(5), 16);
        let written = Instant::now();

        assert_eq!(
            opts.state_at(written, written + Duration::from_secs(10)),
            EntryState::Expired
        );
    }
}
