//! Prometheus metrics for the keyguard agent.
//!
//! This module provides:
//! - Cache metrics (lookups by tier, origin refreshes, evictions, entries)
//! - Rate limit metrics (decisions per tier, backend failures)
//! - Invalidation and event bus metrics
//! - Cache warming metrics
//!
//! Recording is a no-op until a recorder is installed with [`init_metrics`].

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    // Cache metrics
    pub const CACHE_LOOKUPS_TOTAL: &str = "keyguard_cache_lookups_total";
    pub const CACHE_REFRESHES_TOTAL: &str = "keyguard_cache_refreshes_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "keyguard_cache_evictions_total";
    pub const CACHE_ENTRIES: &str = "keyguard_cache_entries";

    // Rate limit metrics
    pub const RATELIMIT_DECISIONS_TOTAL: &str = "keyguard_ratelimit_decisions_total";
    pub const RATELIMIT_BACKEND_FAILURES_TOTAL: &str = "keyguard_ratelimit_backend_failures_total";
    pub const RATELIMIT_WINDOWS: &str = "keyguard_ratelimit_windows";

    // Invalidation and event bus metrics
    pub const INVALIDATIONS_TOTAL: &str = "keyguard_invalidations_total";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "keyguard_events_published_total";
    pub const EVENT_REDELIVERIES_TOTAL: &str = "keyguard_event_redeliveries_total";

    // Warmer metrics
    pub const WARMED_ENTRIES_TOTAL: &str = "keyguard_warmed_entries_total";
    pub const WARM_FAILURES_TOTAL: &str = "keyguard_warm_failures_total";
}

/// Install the Prometheus recorder and describe the keyguard metrics.
///
/// Returns `false` when a recorder is already installed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }
    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed");
            return false;
        }
    };
    if PROMETHEUS_HANDLE.set(handle).is_err() {
        return false;
    }
    describe_metrics();
    true
}

fn describe_metrics() {
    describe_counter!(names::CACHE_LOOKUPS_TOTAL, "Cache lookups by cache and answering tier");
    describe_counter!(names::CACHE_REFRESHES_TOTAL, "Origin refreshes by cache and outcome");
    describe_counter!(names::CACHE_EVICTIONS_TOTAL, "Entries evicted to stay within max_size");
    describe_gauge!(names::CACHE_ENTRIES, "Entries currently held per cache");
    describe_counter!(names::RATELIMIT_DECISIONS_TOTAL, "Rate limit decisions by tier and verdict");
    describe_counter!(
        names::RATELIMIT_BACKEND_FAILURES_TOTAL,
        "Distributed limiter failures by applied policy"
    );
    describe_gauge!(names::RATELIMIT_WINDOWS, "Open local rate limit windows");
    describe_counter!(names::INVALIDATIONS_TOTAL, "Key events applied to the caches");
    describe_counter!(names::EVENTS_PUBLISHED_TOTAL, "Key events emitted on the bus");
    describe_counter!(
        names::EVENT_REDELIVERIES_TOTAL,
        "Key events delivered again after a failure"
    );
    describe_counter!(names::WARMED_ENTRIES_TOTAL, "Entries loaded by the cache warmer");
    describe_counter!(names::WARM_FAILURES_TOTAL, "Warmer pages that failed to load");
}

/// Current metrics in Prometheus text format, if the recorder is ours.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache lookup by the tier it was answered from.
pub fn record_cache_lookup(cache: &str, tier: &'static str) {
    counter!(names::CACHE_LOOKUPS_TOTAL, "cache" => cache.to_string(), "tier" => tier).increment(1);
}

/// Record the outcome of an origin refresh (`hit`, `miss` or `error`).
pub fn record_cache_refresh(cache: &str, outcome: &'static str) {
    counter!(names::CACHE_REFRESHES_TOTAL, "cache" => cache.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record entries dropped by the size bound.
pub fn record_cache_evictions(cache: &str, count: usize) {
    counter!(names::CACHE_EVICTIONS_TOTAL, "cache" => cache.to_string()).increment(count as u64);
}

/// Set the number of cache entries.
pub fn set_cache_entries(cache: &str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "cache" => cache.to_string()).set(count as f64);
}

// =============================================================================
// Rate Limit Metrics
// =============================================================================

/// Record an admission decision made by a limiter tier.
pub fn record_ratelimit_decision(tier: &'static str, passed: bool) {
    let decision = if passed { "pass" } else { "reject" };
    counter!(names::RATELIMIT_DECISIONS_TOTAL, "tier" => tier, "decision" => decision).increment(1);
}

/// Record a distributed limiter backend failure and the policy applied.
pub fn record_ratelimit_backend_failure(policy: &'static str) {
    counter!(names::RATELIMIT_BACKEND_FAILURES_TOTAL, "policy" => policy).increment(1);
}

/// Set the number of live local rate limit windows.
pub fn set_ratelimit_windows(count: usize) {
    gauge!(names::RATELIMIT_WINDOWS).set(count as f64);
}

// =============================================================================
// Invalidation Metrics
// =============================================================================

/// Record a handled key event.
pub fn record_invalidation(event_type: &'static str, outcome: &'static str) {
    counter!(names::INVALIDATIONS_TOTAL, "event_type" => event_type, "outcome" => outcome)
        .increment(1);
}

/// Record an event published onto a bus.
pub fn record_event_published(bus: &'static str) {
    counter!(names::EVENTS_PUBLISHED_TOTAL, "bus" => bus).increment(1);
}

/// Record an event handed back for redelivery.
pub fn record_event_redelivery(bus: &'static str) {
    counter!(names::EVENT_REDELIVERIES_TOTAL, "bus" => bus).increment(1);
}

// =============================================================================
// Warmer Metrics
// =============================================================================

/// Record entries installed by a warming pass.
pub fn record_warmed(kind: &'static str, count: usize) {
    counter!(names::WARMED_ENTRIES_TOTAL, "kind" => kind).increment(count as u64);
}

/// Record a page the warmer could not read.
pub fn record_warm_failure(kind: &'static str) {
    counter!(names::WARM_FAILURES_TOTAL, "kind" => kind).increment(1);
}
