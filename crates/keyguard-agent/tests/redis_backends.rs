//! Integration tests for the Redis-backed rate limiter and event bus.
//!
//! Tests use testcontainers to spin up a real Redis instance shared by every
//! test in this file.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keyguard_agent::events::{HandlerError, RedisEventBusBuilder};
use keyguard_agent::ratelimit::RedisRatelimiter;
use keyguard_agent::{
    BackendFailurePolicy, EventBus, KeyEventHandler, RatelimitRequest, Ratelimiter, RedisConfig,
    create_redis_pool,
};
use keyguard_core::{Key, KeyEvent};
use parking_lot::Mutex;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::{OnceCell, watch};

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_config() -> RedisConfig {
    RedisConfig {
        url: get_redis_url().await,
        pool_size: 8,
        timeout_ms: 2000,
    }
}

fn unique(prefix: &str) -> String {
    format!("{prefix}:{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_limit_holds_across_nodes() {
    let config = redis_config().await;
    let prefix = unique("rl");
    // Two nodes, each with its own pool, sharing one counter.
    let node_a = Arc::new(RedisRatelimiter::new(
        create_redis_pool(&config).unwrap(),
        prefix.clone(),
        BackendFailurePolicy::FailClosed,
    ));
    let node_b = Arc::new(RedisRatelimiter::new(
        create_redis_pool(&config).unwrap(),
        prefix,
        BackendFailurePolicy::FailClosed,
    ));

    let req = RatelimitRequest::new("key_1", 10, Duration::from_secs(30));
    let mut handles = Vec::new();
    for i in 0..40 {
        let limiter = if i % 2 == 0 {
            node_a.clone()
        } else {
            node_b.clone()
        };
        let req = req.clone();
        handles.push(tokio::spawn(async move {
            limiter.take(&req).await.unwrap().pass
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn test_window_resets_and_rejections_are_free() {
    let config = redis_config().await;
    let limiter = RedisRatelimiter::new(
        create_redis_pool(&config).unwrap(),
        unique("rl"),
        BackendFailurePolicy::FailClosed,
    );
    let req = RatelimitRequest::new("key_1", 2, Duration::from_millis(500));

    let first = limiter.take(&req).await.unwrap();
    assert!(first.pass);
    assert_eq!(first.remaining, 1);
    assert!(limiter.take(&req).await.unwrap().pass);
    for _ in 0..3 {
        let rejected = limiter.take(&req).await.unwrap();
        assert!(!rejected.pass);
        assert_eq!(rejected.remaining, 0);
    }

    tokio::time::sleep(Duration::from_millis(600)).await;
    let reset = limiter.take(&req).await.unwrap();
    assert!(reset.pass);
    assert_eq!(reset.remaining, 1);
}

/// Fails the first `failures` deliveries, then records key ids.
struct Recorder {
    failures: AtomicU32,
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicU32::new(failures),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl KeyEventHandler for Recorder {
    async fn handle(&self, event: &KeyEvent) -> Result<(), HandlerError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HandlerError::new("origin down"));
        }
        self.seen.lock().push(event.key.id.clone());
        Ok(())
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_stream_bus_fans_out_and_redelivers() {
    let config = redis_config().await;
    let stream = unique("events");
    let bus_for = |node: &str| {
        RedisEventBusBuilder::new()
            .with_pool(create_redis_pool(&config).unwrap())
            .with_redis_url(config.url.clone())
            .with_stream(stream.clone())
            .with_node_id(node)
            .with_block(Duration::from_millis(200))
            .with_retry_backoff(Duration::from_millis(200))
            .build()
            .map(Arc::new)
            .unwrap()
    };

    let healthy = Recorder::new(0);
    let flaky = Recorder::new(1);
    let node_a = bus_for("node-a");
    let node_b = bus_for("node-b");
    node_a.on_key_event(healthy.clone());
    node_b.on_key_event(flaky.clone());

    let (tx, rx) = watch::channel(false);
    let task_a = node_a.clone().start(rx.clone());
    let task_b = node_b.clone().start(rx);
    // Groups start at `$`; let both consumers subscribe before publishing.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let key = Key::new("key_1", "hash_1", "ka_1");
    node_a.emit_key_event(&KeyEvent::created(&key)).await.unwrap();

    assert!(eventually(|| healthy.seen.lock().len() == 1).await);
    // node-b failed once and picks the entry up again from its pending list.
    assert!(eventually(|| flaky.seen.lock().len() == 1).await);
    assert_eq!(flaky.seen.lock()[0], "key_1");

    tx.send(true).unwrap();
    task_a.await.unwrap();
    task_b.await.unwrap();
}
