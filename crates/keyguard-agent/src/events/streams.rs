//! Key event bus on Redis Streams.
//!
//! Every node reads the stream through its own consumer group, so each node
//! sees every event. An entry is acknowledged (XACK) only after all handlers
//! succeeded; failed entries stay in the group's pending list and are read
//! again from id `0` once `retry_backoff` has passed.
//!
//! ## Example Flow
//!
//! ```text
//! Origin writer: XADD keyguard:key-events MAXLEN ~ 100000 * payload {...}
//!   ↓
//! Node eu-1: XREADGROUP GROUP keyguard:eu-1 eu-1 ... > → handle → XACK
//! Node us-1: XREADGROUP GROUP keyguard:us-1 us-1 ... > → handle fails
//!   ↓ (after retry_backoff)
//! Node us-1: XREADGROUP GROUP keyguard:us-1 us-1 ... 0 → handle → XACK
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use keyguard_core::KeyEvent;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{EventBus, EventBusError, HandlerSet, KeyEventHandler};

/// Field holding the JSON-encoded event in each stream entry.
const PAYLOAD_FIELD: &str = "payload";

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(300);

/// Redis Streams event bus.
pub struct RedisEventBus {
    pool: Pool,
    redis_url: String,
    stream: String,
    group: String,
    consumer: String,
    max_len: usize,
    batch_size: usize,
    block: Duration,
    retry_backoff: Duration,
    handlers: HandlerSet,
}

enum ReadFrom {
    /// Entries never delivered to this group.
    New,
    /// Entries delivered to this consumer but not yet acknowledged.
    Pending,
}

impl ReadFrom {
    fn id(&self) -> &'static str {
        match self {
            ReadFrom::New => ">",
            ReadFrom::Pending => "0",
        }
    }
}

impl RedisEventBus {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Consume until shutdown, reconnecting with exponential backoff.
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(stream = %self.stream, group = %self.group, "Starting Redis key event consumer");
        let mut backoff = Duration::from_secs(1);

        loop {
            match self.consume(&mut shutdown).await {
                Ok(()) => {
                    info!(stream = %self.stream, "Redis key event consumer stopped gracefully");
                    break;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Redis key event consumer error, reconnecting..."
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        result = shutdown.changed() => {
                            if result.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                }
            }
        }
    }

    /// Main consumption loop on a dedicated connection.
    ///
    /// Blocking reads would stall every other user of a pooled connection.
    async fn consume(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), EventBusError> {
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| EventBusError::Connection(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EventBusError::Connection(e.to_string()))?;

        self.ensure_group(&mut conn).await?;
        info!(stream = %self.stream, group = %self.group, consumer = %self.consumer, "Subscribed to key event stream");

        // Anything left pending from a previous run is retried right away.
        let mut last_pending_scan: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let pending_due =
                last_pending_scan.is_none_or(|at| at.elapsed() >= self.retry_backoff);
            if pending_due {
                self.read_batch(&mut conn, ReadFrom::Pending).await?;
                last_pending_scan = Some(Instant::now());
            }

            tokio::select! {
                result = self.read_batch(&mut conn, ReadFrom::New) => { result?; }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> Result<(), EventBusError> {
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;
        match created {
            Ok(()) => {
                debug!(stream = %self.stream, group = %self.group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(EventBusError::Connection(format!(
                "failed to create consumer group: {e}"
            ))),
        }
    }

    /// Read one batch and handle it. Returns how many entries were read.
    async fn read_batch(
        &self,
        conn: &mut MultiplexedConnection,
        from: ReadFrom,
    ) -> Result<usize, EventBusError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.batch_size);
        if matches!(from, ReadFrom::New) {
            options = options.block(self.block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[from.id()], &options)
            .await
            .map_err(|e| EventBusError::Read(e.to_string()))?;

        let Some(reply) = reply else {
            return Ok(0);
        };

        let mut read = 0;
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                read += 1;
                self.handle_entry(conn, &entry).await?;
            }
        }
        Ok(read)
    }

    async fn handle_entry(
        &self,
        conn: &mut MultiplexedConnection,
        entry: &StreamId,
    ) -> Result<(), EventBusError> {
        let payload: Option<String> = entry.get(PAYLOAD_FIELD);
        let event = match payload.as_deref().map(KeyEvent::decode) {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(entry_id = %entry.id, error = %e, "dropping undecodable key event");
                return self.ack(conn, &entry.id).await;
            }
            None => {
                warn!(entry_id = %entry.id, "dropping key event without payload");
                return self.ack(conn, &entry.id).await;
            }
        };

        match self.handlers.dispatch(&event).await {
            Ok(()) => {
                debug!(
                    entry_id = %entry.id,
                    event_type = %event.event_type,
                    key_id = %event.key.id,
                    "handled key event"
                );
                self.ack(conn, &entry.id).await
            }
            Err(e) => {
                warn!(
                    entry_id = %entry.id,
                    event_type = %event.event_type,
                    key_id = %event.key.id,
                    error = %e,
                    "key event left pending for redelivery"
                );
                crate::metrics::record_event_redelivery(self.kind());
                Ok(())
            }
        }
    }

    async fn ack(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<(), EventBusError> {
        let _: i64 = conn
            .xack(&self.stream, &self.group, &[id])
            .await
            .map_err(|e| EventBusError::Read(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn on_key_event(&self, handler: Arc<dyn KeyEventHandler>) {
        self.handlers.push(handler);
    }

    async fn emit_key_event(&self, event: &KeyEvent) -> Result<(), EventBusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| EventBusError::Pool(e.to_string()))?;

        let payload = event.encode()?;
        let id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[(PAYLOAD_FIELD, payload.as_str())],
            )
            .await
            .map_err(|e| EventBusError::Publish(e.to_string()))?;

        crate::metrics::record_event_published(self.kind());
        debug!(
            entry_id = %id,
            event_type = %event.event_type,
            key_id = %event.key.id,
            "Published key event to Redis"
        );
        Ok(())
    }

    fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}

/// Builder for the Redis Streams event bus.
#[derive(Default)]
pub struct RedisEventBusBuilder {
    pool: Option<Pool>,
    redis_url: Option<String>,
    stream: Option<String>,
    node_id: Option<String>,
    max_len: Option<usize>,
    batch_size: Option<usize>,
    block: Option<Duration>,
    retry_backoff: Option<Duration>,
}

impl RedisEventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool used for publishing.
    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// URL for the dedicated consumer connection.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Node identity; names this node's consumer group and consumer.
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Approximate cap on stream length kept by XADD.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// How long one read waits for new entries.
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }

    /// Delay before pending entries are read again.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    pub fn build(self) -> Result<RedisEventBus, EventBusError> {
        let pool = self
            .pool
            .ok_or_else(|| EventBusError::Config("Redis pool is required".to_string()))?;
        let redis_url = self
            .redis_url
            .ok_or_else(|| EventBusError::Config("Redis URL is required".to_string()))?;
        let node_id = self
            .node_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EventBusError::Config("node id is required".to_string()))?;

        Ok(RedisEventBus {
            pool,
            redis_url,
            stream: self
                .stream
                .unwrap_or_else(|| "keyguard:key-events".to_string()),
            group: format!("keyguard:{node_id}"),
            consumer: node_id,
            max_len: self.max_len.unwrap_or(100_000),
            batch_size: self.batch_size.unwrap_or(64).max(1),
            block: self.block.unwrap_or(Duration::from_secs(5)),
            retry_backoff: self.retry_backoff.unwrap_or(Duration::from_secs(5)),
            handlers: HandlerSet::default(),
        })
    }
}
