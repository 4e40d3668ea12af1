//! Integration tests for the two-tier cache manager.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tierstore::provider::memory::MemoryStore;
use tierstore::{CacheConfig, CacheManager, NoopTelemetry, StorageProvider, Temperature, TierConfig};

fn tier(max_entries: usize) -> TierConfig {
    TierConfig {
        max_entries,
        ttl: None,
        ..TierConfig::volatile_default()
    }
}

struct Fixture {
    cache: CacheManager,
    volatile: Arc<MemoryStore>,
    durable: Arc<MemoryStore>,
}

fn fixture(volatile_entries: usize) -> Fixture {
    let volatile = Arc::new(MemoryStore::new(tier(volatile_entries)));
    let durable = Arc::new(MemoryStore::new(tier(5000)));
    let config = CacheConfig {
        memory: tier(volatile_entries),
        durable: tier(5000),
    };
    let cache = CacheManager::new(
        volatile.clone(),
        durable.clone(),
        config,
        Arc::new(NoopTelemetry),
    );
    Fixture {
        cache,
        volatile,
        durable,
    }
}

async fn wait_for_key(store: &MemoryStore, key: &str) {
    for _ in 0..100 {
        if store.exists(key).await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{key} not present within 1s");
}

#[tokio::test]
async fn test_hot_write_lands_in_both_tiers() {
    let f = fixture(100);
    f.cache
        .set("session:s1", json!({"id": "s1"}), Some(Temperature::Hot))
        .await;

    assert!(f.volatile.exists("session:s1").await.unwrap());
    assert!(f.durable.exists("session:s1").await.unwrap());
    assert_eq!(f.cache.get_temperature("session:s1").await, Temperature::Hot);
}

#[tokio::test]
async fn test_warm_write_under_pressure_serves_without_promotion() {
    // Volatile tier far under 80% usage: a WARM write lands there too, so
    // the next read is a volatile hit and records no promotion.
    let f = fixture(100);
    f.cache
        .set("session:s1", json!({"id": "s1"}), Some(Temperature::Warm))
        .await;

    let value = f.cache.get("session:s1").await;
    assert_eq!(value, Some(json!({"id": "s1"})));

    let metrics = f.cache.metrics().await;
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.promotions, 0);
}

#[tokio::test]
async fn test_round_trip_per_temperature() {
    let f = fixture(100);
    for (key, temperature) in [
        ("session:hot", Temperature::Hot),
        ("session:warm", Temperature::Warm),
        ("session:cold", Temperature::Cold),
    ] {
        let value = json!({"key": key});
        f.cache.set(key, value.clone(), Some(temperature)).await;
        assert_eq!(f.cache.get(key).await, Some(value), "{key} round trip");
    }
}

#[tokio::test]
async fn test_cold_read_promotes_into_volatile() {
    let f = fixture(100);
    f.cache
        .set("session:s1", json!({"id": "s1"}), Some(Temperature::Cold))
        .await;
    assert!(!f.volatile.exists("session:s1").await.unwrap());

    assert!(f.cache.get("session:s1").await.is_some());
    assert!(f.volatile.exists("session:s1").await.unwrap());
    assert_eq!(f.cache.get_temperature("session:s1").await, Temperature::Hot);
    assert_eq!(f.cache.metrics().await.promotions, 1);
}

#[tokio::test]
async fn test_demote_then_get_repromotes() {
    let f = fixture(100);
    f.cache
        .set("session:s1", json!({"id": "s1"}), Some(Temperature::Hot))
        .await;

    f.cache.demote_to_cold("session:s1").await;
    assert_eq!(f.cache.get_temperature("session:s1").await, Temperature::Warm);
    assert_eq!(f.cache.metrics().await.demotions, 1);

    assert!(f.cache.get("session:s1").await.is_some());
    assert_eq!(f.cache.get_temperature("session:s1").await, Temperature::Hot);
}

#[tokio::test]
async fn test_miss_is_counted_and_returns_none() {
    let f = fixture(100);
    assert_eq!(f.cache.get("session:absent").await, None);
    let metrics = f.cache.metrics().await;
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.hits, 0);
    assert_eq!(metrics.total_requests, 1);
}

#[tokio::test]
async fn test_delete_removes_from_both_tiers() {
    let f = fixture(100);
    f.cache
        .set("session:s1", json!({"id": "s1"}), Some(Temperature::Hot))
        .await;

    assert!(f.cache.delete("session:s1").await);
    assert!(!f.volatile.exists("session:s1").await.unwrap());
    assert!(!f.durable.exists("session:s1").await.unwrap());
    assert!(!f.cache.delete("session:s1").await);
}

#[tokio::test]
async fn test_mset_mget_round_trip() {
    let f = fixture(100);
    let items: Vec<(String, Value)> = (0..5)
        .map(|i| (format!("session:s{i}"), json!({"n": i})))
        .collect();
    let keys: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();

    f.cache.mset(items).await;
    let values = f.cache.mget(&keys).await;
    assert_eq!(values.len(), 5);
    for (i, value) in values.iter().enumerate() {
        assert_eq!(value.as_ref(), Some(&json!({"n": i})));
    }
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let f = fixture(100);
    for i in 0..10 {
        f.cache
            .set(
                &format!("session:s{i}"),
                json!({"n": i}),
                Some(Temperature::Hot),
            )
            .await;
    }

    f.cache.cleanup().await;
    f.cache.cleanup().await;

    for i in 0..10 {
        assert!(
            f.cache.get(&format!("session:s{i}")).await.is_some(),
            "entry s{i} survived cleanup"
        );
    }
}

#[tokio::test]
async fn test_preload_warms_volatile_tier() {
    let f = fixture(100);
    f.durable
        .set("session:s1", json!({"id": "s1"}), None)
        .await
        .unwrap();

    f.cache.preload(vec!["session:s1".to_string()]);

    wait_for_key(&f.volatile, "session:s1").await;
    assert!(f.cache.metrics().await.preloads >= 1);
}

#[tokio::test]
async fn test_promote_to_hot_from_durable() {
    let f = fixture(100);
    f.durable
        .set("session:s1", json!({"id": "s1"}), None)
        .await
        .unwrap();

    assert!(f.cache.promote_to_hot("session:s1").await.unwrap());
    assert!(f.volatile.exists("session:s1").await.unwrap());
    assert!(!f.cache.promote_to_hot("session:absent").await.unwrap());
}

#[tokio::test]
async fn test_reset_metrics() {
    let f = fixture(100);
    f.cache.get("session:absent").await;
    assert_eq!(f.cache.metrics().await.total_requests, 1);

    f.cache.reset_metrics().await;
    assert_eq!(f.cache.metrics().await.total_requests, 0);
}
