// Tracing initialization with a reloadable level filter.
use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::config::NodeConfig;

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    // RUST_LOG wins over the configured level.
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Apply a new logging level at runtime if tracing was initialized here.
///
/// Returns false when the level does not parse or no reload handle exists.
pub fn apply_logging_level(level: &str) -> bool {
    let Ok(filter) = EnvFilter::try_new(level) else {
        tracing::warn!(level, "ignoring invalid logging level");
        return false;
    };
    match LOG_RELOAD_HANDLE.get() {
        Some(handle) => handle.modify(|f| *f = filter).is_ok(),
        None => false,
    }
}

/// Span carrying the node identity; background tasks run inside it.
pub fn node_span(node: &NodeConfig) -> tracing::Span {
    tracing::info_span!(
        "keyguard_node",
        node_id = %node.id,
        region = node.region.as_deref().unwrap_or("-"),
    )
}
