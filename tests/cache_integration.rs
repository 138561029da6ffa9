//! Cache subsystem integration tests
//!
//! Exercises the backend contract invariants through the cache manager,
//! the way the request path uses it.

#[allow(dead_code)]
mod common;

use bytes::Bytes;
use common::fixtures::{file_sizes, TestDataGenerator};
use std::sync::Arc;
use std::time::Duration;
use vodedge::cache::{cache_key, CacheManager, CacheMode, SetOptions};
use vodedge::capacity::CapacityManager;
use vodedge::config::EdgeConfig;

fn manager() -> CacheManager {
    CacheManager::new(&EdgeConfig::default())
}

// =============================================================================
// Backend contract invariants
// =============================================================================

#[tokio::test]
async fn test_set_then_get_returns_fresh_item() {
    let cache = manager();
    cache.init().await.unwrap();

    let mut gen = TestDataGenerator::default();
    let payload = Bytes::from(gen.random_bytes(file_sizes::SMALL));
    let ttl = Duration::from_secs(120);

    assert!(
        cache
            .set("vod/videos/a.mp4", payload.clone(), SetOptions::with_ttl(ttl))
            .await
    );

    let item = cache.get("vod/videos/a.mp4").await.expect("hit");
    assert_eq!(item.data, payload);
    assert_eq!(item.size, payload.len() as u64);

    // expires_at sits roughly at now + ttl.
    let expected = chrono::Utc::now() + chrono::Duration::seconds(120);
    let skew = (item.expires_at - expected).num_seconds().abs();
    assert!(skew <= 2, "expiry skew of {skew}s");
}

#[tokio::test]
async fn test_delete_makes_key_unobservable() {
    let cache = manager();
    cache.init().await.unwrap();

    cache.set("k", Bytes::from_static(b"x"), SetOptions::default()).await;
    assert!(cache.delete("k").await);

    assert!(!cache.exists("k").await);
    assert!(cache.get("k").await.is_none());
}

#[tokio::test]
async fn test_ttl_expiry_is_a_miss() {
    let cache = manager();
    cache.init().await.unwrap();

    cache
        .set(
            "short-lived",
            Bytes::from_static(b"x"),
            SetOptions::with_ttl(Duration::from_millis(20)),
        )
        .await;
    assert!(cache.exists("short-lived").await);

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(cache.get("short-lived").await.is_none());
    assert!(!cache.exists("short-lived").await);
}

#[tokio::test]
async fn test_hit_count_listing_is_bounded_and_sorted() {
    let cache = manager();
    cache.init().await.unwrap();

    for (key, gets) in [("a", 4), ("b", 1), ("c", 3), ("d", 0)] {
        cache.set(key, Bytes::from_static(b"x"), SetOptions::default()).await;
        for _ in 0..gets {
            cache.get(key).await;
        }
    }

    let listing = cache.items_by_hit_count(3).await;
    assert!(listing.len() <= 3);
    for pair in listing.windows(2) {
        assert!(pair[0].hit_count <= pair[1].hit_count);
    }
    assert_eq!(listing[0].key, "d");
}

#[tokio::test]
async fn test_clear_forgets_all_prior_keys() {
    let cache = manager();
    cache.init().await.unwrap();

    let keys = ["x/1.ts", "x/2.ts", "x/3.ts"];
    for key in keys {
        cache.set(key, Bytes::from_static(b"seg"), SetOptions::default()).await;
    }

    assert!(cache.clear().await);
    assert_eq!(cache.stats().await.items, 0);
    for key in keys {
        assert!(cache.get(key).await.is_none());
    }
}

#[tokio::test]
async fn test_stats_track_hits_and_misses() {
    let cache = manager();
    cache.init().await.unwrap();

    cache.set("k", Bytes::from_static(b"x"), SetOptions::default()).await;
    cache.get("k").await;
    cache.get("k").await;
    cache.get("absent").await;

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 0.001);
    assert!(stats.connected);
}

// =============================================================================
// Cache key semantics
// =============================================================================

#[test]
fn test_range_varies_the_cache_key() {
    let plain = cache_key("vod", "videos/a.mp4", None);
    let ranged = cache_key("vod", "videos/a.mp4", Some("bytes=0-1023"));
    let other_range = cache_key("vod", "videos/a.mp4", Some("bytes=1024-2047"));

    assert_ne!(plain, ranged);
    assert_ne!(ranged, other_range);
    assert_eq!(plain, cache_key("vod", "videos/a.mp4", None));
}

// =============================================================================
// Mode lifecycle scenarios
// =============================================================================

#[tokio::test]
async fn test_unreachable_redis_falls_back_to_memory() {
    let mut config = EdgeConfig::default();
    config.cache.mode = CacheMode::Redis;
    config.redis.host = "127.0.0.1".to_string();
    config.redis.port = 9;
    config.redis.connect_timeout = Duration::from_millis(200);

    let cache = CacheManager::new(&config);
    cache.init().await.expect("service must come up");

    assert_eq!(cache.mode().await, CacheMode::Memory);
    assert_eq!(cache.stats().await.mode, "memory");
    assert!(cache.fell_back());

    // The fallback is fully functional.
    assert!(cache.set("k", Bytes::from_static(b"x"), SetOptions::default()).await);
    assert!(cache.get("k").await.is_some());
}

#[tokio::test]
async fn test_runtime_switch_reinitializes_cleanly() {
    let cache = manager();
    cache.init().await.unwrap();

    cache.set("pre-switch", Bytes::from_static(b"x"), SetOptions::default()).await;

    let mode = cache.switch_backend(CacheMode::Memory).await.unwrap();
    assert_eq!(mode, CacheMode::Memory);
    assert_eq!(cache.stats().await.mode, "memory");

    // Items never survive a switch.
    assert!(!cache.exists("pre-switch").await);
}

// =============================================================================
// Capacity watchdog wiring
// =============================================================================

#[tokio::test]
async fn test_forced_cycle_leaves_memory_mode_alone() {
    let cache = Arc::new(manager());
    cache.init().await.unwrap();

    let mut gen = TestDataGenerator::default();
    for i in 0..8 {
        cache
            .set(
                &format!("seg/{i}.ts"),
                Bytes::from(gen.random_bytes(file_sizes::SMALL)),
                SetOptions::default(),
            )
            .await;
    }

    let watchdog = CapacityManager::new(Arc::clone(&cache), &Default::default());
    let report = watchdog.force_capacity_check().await;

    assert_eq!(report.mode, "memory");
    assert_eq!(report.evicted, 0);
    assert_eq!(report.migrated, 0);
    assert_eq!(cache.stats().await.items, 8);
}

#[tokio::test]
async fn test_watchdog_start_and_stop() {
    let cache = Arc::new(manager());
    cache.init().await.unwrap();

    let mut capacity_config = vodedge::config::CapacityConfig::default();
    capacity_config.check_interval = Duration::from_millis(20);

    let watchdog = Arc::new(CapacityManager::new(Arc::clone(&cache), &capacity_config));
    watchdog.start();

    tokio::time::sleep(Duration::from_millis(100)).await;
    watchdog.stop_monitoring();

    // Give the in-flight tick a moment to finish before sampling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cycles = watchdog.stats().await.cycles;
    assert!(cycles >= 1, "expected at least one cycle, saw {cycles}");

    // No further cycles after stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(watchdog.stats().await.cycles, cycles);
}
