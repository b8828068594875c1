//! End-to-end admission flow on one node: key resolution through the caches,
//! invalidation over the local event bus, and rate limiting.

use std::sync::Arc;
use std::time::Duration;

use keyguard_agent::config::EventBusKind;
use keyguard_agent::{AgentBuilder, AgentConfig, Consistency, RatelimitRequest};
use keyguard_core::{Api, InMemoryOriginStore, Key, KeyEvent};

/// Poll `check` until it holds or a second has passed.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn local_bus_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.event_bus.kind = EventBusKind::Local;
    config.event_bus.retry_backoff_ms = 10;
    config
}

#[tokio::test]
async fn test_resolve_hits_origin_once_then_serves_from_cache() {
    let store = Arc::new(InMemoryOriginStore::new());
    store.insert_api(Api::new("api_1", "ka_1"));
    store.insert_key(Key::new("key_1", "hash_1", "ka_1"));

    let agent = AgentBuilder::new()
        .with_config(local_bus_config())
        .with_origin(store.clone())
        .build()
        .await
        .expect("agent builds");

    let first = agent.resolve("hash_1").await.unwrap().unwrap();
    let after_first = store.lookup_count();
    let second = agent.resolve("hash_1").await.unwrap().unwrap();

    assert_eq!(first.key.id, second.key.id);
    assert_eq!(after_first, 2, "one key lookup and one api lookup");
    assert_eq!(store.lookup_count(), after_first);
    assert_eq!(agent.keys().stats().hits, 1);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_key_lifecycle_events_keep_caches_coherent() {
    let store = Arc::new(InMemoryOriginStore::new());
    store.insert_api(Api::new("api_1", "ka_1").with_name("payments"));

    let agent = AgentBuilder::new()
        .with_config(local_bus_config())
        .with_origin(store.clone())
        .build()
        .await
        .expect("agent builds");
    let bus = agent.event_bus();

    // Created: both caches are filled without a request ever missing.
    let key = Key::new("key_1", "hash_1", "ka_1").with_name("v1");
    store.insert_key(key.clone());
    bus.emit_key_event(&KeyEvent::created(&key)).await.unwrap();
    assert!(
        eventually(|| {
            agent.keys().peek("hash_1").is_some() && agent.apis().peek("ka_1").is_some()
        })
        .await
    );

    // Updated: cached values are replaced.
    store.insert_key(Key::new("key_1", "hash_1", "ka_1").with_name("v2"));
    store.insert_api(Api::new("api_1", "ka_1").with_name("billing"));
    bus.emit_key_event(&KeyEvent::updated(&key)).await.unwrap();
    assert!(
        eventually(|| {
            agent
                .keys()
                .peek("hash_1")
                .is_some_and(|(k, _)| k.name.as_deref() == Some("v2"))
        })
        .await
    );
    assert!(
        eventually(|| {
            agent
                .apis()
                .peek("ka_1")
                .is_some_and(|(a, _)| a.name == "billing")
        })
        .await
    );

    // Deleted: the key is gone, the api stays.
    store.remove_key("key_1");
    bus.emit_key_event(&KeyEvent::deleted("key_1", "hash_1"))
        .await
        .unwrap();
    assert!(eventually(|| agent.keys().peek("hash_1").is_none()).await);
    assert!(agent.apis().peek("ka_1").is_some());
    assert!(agent.resolve("hash_1").await.unwrap().is_none());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_failed_invalidation_is_redelivered() {
    let store = Arc::new(InMemoryOriginStore::new());
    store.insert_api(Api::new("api_1", "ka_1"));
    let key = Key::new("key_1", "hash_1", "ka_1");
    store.insert_key(key.clone());
    store.set_unavailable(true);

    let mut config = local_bus_config();
    config.event_bus.max_local_attempts = 100;
    let agent = AgentBuilder::new()
        .with_config(config)
        .with_origin(store.clone())
        .build()
        .await
        .expect("agent builds");

    agent
        .event_bus()
        .emit_key_event(&KeyEvent::created(&key))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(agent.keys().peek("hash_1").is_none());

    store.set_unavailable(false);
    assert!(eventually(|| agent.keys().peek("hash_1").is_some()).await);

    agent.shutdown().await;
}

#[tokio::test]
async fn test_origin_outage_is_an_error_not_a_miss() {
    let store = Arc::new(InMemoryOriginStore::new());
    store.set_unavailable(true);

    let agent = AgentBuilder::new()
        .with_origin(store.clone())
        .build()
        .await
        .expect("agent builds");

    assert!(agent.resolve("hash_1").await.is_err());
    store.set_unavailable(false);
    assert!(agent.resolve("hash_1").await.unwrap().is_none());

    agent.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_admits_exactly_limit_per_window() {
    let agent = AgentBuilder::new()
        .with_origin(Arc::new(InMemoryOriginStore::new()))
        .build()
        .await
        .expect("agent builds");

    let req = RatelimitRequest::new("key_1", 5, Duration::from_millis(200));
    let mut admitted = 0;
    for _ in 0..8 {
        if agent.take(&req, Consistency::Fast).await.unwrap().pass {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let res = agent.take(&req, Consistency::Fast).await.unwrap();
    assert!(res.pass);
    assert_eq!(res.remaining, 4);

    agent.shutdown().await;
}
