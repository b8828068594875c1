//! Key event bus.
//!
//! Producers publish [`KeyEvent`]s with [`EventBus::emit_key_event`]; every
//! node registers handlers with [`EventBus::on_key_event`] and starts
//! consumption with [`EventBus::start`]. A handler error means "not done":
//! the bus hands the same event back later, so handlers must be idempotent.
//!
//! ## Variants
//!
//! - [`NoopEventBus`]: drops everything (single node, no coherence needed)
//! - [`LocalEventBus`]: in-process channel with bounded in-place retries
//! - [`RedisEventBus`]: Redis Streams, one consumer group per node, entries
//!   acknowledged only after every handler succeeded

mod streams;

pub use streams::{RedisEventBus, RedisEventBusBuilder};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keyguard_core::KeyEvent;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Failure reported by a handler; the event will be delivered again.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Reacts to key events.
#[async_trait]
pub trait KeyEventHandler: Send + Sync {
    async fn handle(&self, event: &KeyEvent) -> Result<(), HandlerError>;
}

/// Errors that can occur on the event bus itself.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Event publish error: {0}")]
    Publish(String),

    #[error("Event read error: {0}")]
    Read(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Event bus configuration error: {0}")]
    Config(String),

    #[error("Event bus is closed")]
    Closed,
}

impl From<keyguard_core::CoreError> for EventBusError {
    fn from(e: keyguard_core::CoreError) -> Self {
        EventBusError::Serialization(e.to_string())
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Register a handler for every key event this node consumes.
    fn on_key_event(&self, handler: Arc<dyn KeyEventHandler>);

    /// Publish an event to every node.
    async fn emit_key_event(&self, event: &KeyEvent) -> Result<(), EventBusError>;

    /// Start consuming until `shutdown` flips to true.
    fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()>;

    /// Short name used in logs and metrics.
    fn kind(&self) -> &'static str;
}

/// Registered handlers, snapshotted before each dispatch so no lock is held
/// while handlers run.
#[derive(Default)]
pub(crate) struct HandlerSet {
    handlers: RwLock<Vec<Arc<dyn KeyEventHandler>>>,
}

impl HandlerSet {
    pub(crate) fn push(&self, handler: Arc<dyn KeyEventHandler>) {
        self.handlers.write().push(handler);
    }

    /// Run every handler; the first failure is returned after all have run.
    pub(crate) async fn dispatch(&self, event: &KeyEvent) -> Result<(), HandlerError> {
        let handlers = self.handlers.read().clone();
        let mut first_error = None;

        for handler in handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::warn!(
                    event_type = %event.event_type,
                    key_id = %event.key.id,
                    error = %e,
                    "key event handler failed"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Bus that publishes nowhere and never delivers.
#[derive(Default)]
pub struct NoopEventBus;

#[async_trait]
impl EventBus for NoopEventBus {
    fn on_key_event(&self, _handler: Arc<dyn KeyEventHandler>) {}

    async fn emit_key_event(&self, _event: &KeyEvent) -> Result<(), EventBusError> {
        Ok(())
    }

    fn start(self: Arc<Self>, _shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    fn kind(&self) -> &'static str {
        "none"
    }
}

/// In-process bus for a single node or tests.
///
/// Events are handled one at a time in publish order. A failed event is
/// retried in place after `retry_backoff`, up to `max_attempts` deliveries,
/// and then dropped with an error log.
pub struct LocalEventBus {
    tx: mpsc::Sender<KeyEvent>,
    rx: Mutex<Option<mpsc::Receiver<KeyEvent>>>,
    handlers: HandlerSet,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl LocalEventBus {
    pub fn new(capacity: usize, max_attempts: u32, retry_backoff: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: HandlerSet::default(),
            max_attempts: max_attempts.max(1),
            retry_backoff,
        }
    }

    async fn deliver(&self, event: KeyEvent, shutdown: &mut watch::Receiver<bool>) {
        for attempt in 1..=self.max_attempts {
            match self.handlers.dispatch(&event).await {
                Ok(()) => return,
                Err(e) if attempt == self.max_attempts => {
                    tracing::error!(
                        event_type = %event.event_type,
                        key_id = %event.key.id,
                        attempts = attempt,
                        error = %e,
                        "dropping key event after exhausting retries"
                    );
                }
                Err(_) => {
                    crate::metrics::record_event_redelivery(self.kind());
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    fn on_key_event(&self, handler: Arc<dyn KeyEventHandler>) {
        self.handlers.push(handler);
    }

    async fn emit_key_event(&self, event: &KeyEvent) -> Result<(), EventBusError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| EventBusError::Closed)?;
        crate::metrics::record_event_published(self.kind());
        Ok(())
    }

    fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let Some(mut rx) = self.rx.lock().take() else {
            tracing::warn!("local event bus already started");
            return tokio::spawn(async {});
        };

        tokio::spawn(async move {
            tracing::info!("Starting local key event consumer");
            loop {
                tokio::select! {
                    biased;

                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            tracing::info!("Local key event consumer shutting down");
                            break;
                        }
                    }
                    next = rx.recv() => match next {
                        Some(event) => self.deliver(event, &mut shutdown).await,
                        None => break,
                    },
                }
            }
        })
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
