//! Fetch pipeline integration tests
//!
//! Drives the streaming pipeline end to end against a scripted in-process
//! origin: cache fills, range passthrough, playlist rewriting, and the
//! cacheable-size boundary.

#[allow(dead_code)]
mod common;

use bytes::Bytes;
use common::eventually;
use common::fixtures::{file_sizes, sample_media_playlist, TestDataGenerator};
use common::origin::{ScriptedObject, ScriptedOrigin};
use std::sync::Arc;
use std::time::Duration;
use vodedge::cache::{cache_key, CacheManager};
use vodedge::config::EdgeConfig;
use vodedge::proxy::FetchPipeline;

struct Harness {
    cache: Arc<CacheManager>,
    origin: Arc<ScriptedOrigin>,
    pipeline: FetchPipeline,
}

async fn harness(mutate: impl FnOnce(&mut EdgeConfig)) -> Harness {
    let mut config = EdgeConfig::default();
    config.server.public_base_url = Some("http://edge.local:8080".to_string());
    mutate(&mut config);

    let cache = Arc::new(CacheManager::new(&config));
    cache.init().await.unwrap();

    let origin = Arc::new(ScriptedOrigin::new());
    let pipeline = FetchPipeline::new(
        Arc::clone(&cache),
        Arc::clone(&origin) as Arc<dyn vodedge::origin::ObjectStore>,
        &config,
    )
    .unwrap();

    Harness {
        cache,
        origin,
        pipeline,
    }
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable")
}

fn header<'a>(response: &'a axum::response::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

// =============================================================================
// Cold fetch and repeat hit
// =============================================================================

#[tokio::test]
async fn test_cold_fetch_fills_cache_and_repeat_hits() {
    let h = harness(|_| {}).await;
    let mut gen = TestDataGenerator::default();
    let payload = Bytes::from(gen.random_bytes(file_sizes::SEGMENT));

    h.origin.put(
        "vod",
        "videos/a.mp4",
        ScriptedObject::new(payload.clone()).with_content_type("video/mp4"),
    );

    let response = h
        .pipeline
        .serve_get("vod", "videos/a.mp4", None, "/cdn/videos/a.mp4")
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-cache"), Some("MISS"));
    assert_eq!(header(&response, "content-type"), Some("video/mp4"));
    assert_eq!(
        header(&response, "cache-control"),
        Some("public, max-age=3600")
    );
    assert_eq!(header(&response, "accept-ranges"), Some("bytes"));
    assert_eq!(
        header(&response, "content-length"),
        Some(payload.len().to_string().as_str())
    );

    let served = body_bytes(response).await;
    assert_eq!(served, payload);

    // The tee admits the buffer after the stream ends.
    let key = cache_key("vod", "videos/a.mp4", None);
    let cache = Arc::clone(&h.cache);
    assert!(
        eventually(Duration::from_secs(2), move || {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            async move { cache.exists(&key).await }
        })
        .await,
        "cache fill never landed"
    );

    // Repeat GET: served from cache, byte-identical, no origin round trip.
    let calls_before = h.origin.get_calls();
    let repeat = h
        .pipeline
        .serve_get("vod", "videos/a.mp4", None, "/cdn/videos/a.mp4")
        .await
        .unwrap();

    assert_eq!(repeat.status(), 200);
    assert_eq!(header(&repeat, "x-cache"), Some("HIT"));
    assert_eq!(body_bytes(repeat).await, payload);
    assert_eq!(h.origin.get_calls(), calls_before);
}

// =============================================================================
// Range requests
// =============================================================================

#[tokio::test]
async fn test_range_request_forwards_206_and_never_caches() {
    let h = harness(|_| {}).await;
    let mut gen = TestDataGenerator::default();
    let payload = Bytes::from(gen.random_bytes(file_sizes::SEGMENT));

    h.origin.put(
        "vod",
        "videos/a.mp4",
        ScriptedObject::new(payload.clone()).with_content_type("video/mp4"),
    );

    let response = h
        .pipeline
        .serve_get(
            "vod",
            "videos/a.mp4",
            Some("bytes=0-1023"),
            "/cdn/videos/a.mp4",
        )
        .await
        .unwrap();

    assert_eq!(response.status(), 206);
    assert_eq!(header(&response, "x-cache"), Some("MISS"));
    assert_eq!(
        header(&response, "content-range"),
        Some(format!("bytes 0-1023/{}", payload.len()).as_str())
    );

    let served = body_bytes(response).await;
    assert_eq!(served, payload.slice(0..1024));

    // Neither the ranged key nor the plain key was populated.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !h.cache
            .exists(&cache_key("vod", "videos/a.mp4", Some("bytes=0-1023")))
            .await
    );
    assert!(!h.cache.exists(&cache_key("vod", "videos/a.mp4", None)).await);
}

// =============================================================================
// Playlist rewriting
// =============================================================================

#[tokio::test]
async fn test_playlist_rewritten_and_cached() {
    let h = harness(|_| {}).await;
    h.origin.put(
        "vod",
        "v/index.m3u8",
        ScriptedObject::new(sample_media_playlist())
            .with_content_type("application/vnd.apple.mpegurl"),
    );

    let response = h
        .pipeline
        .serve_get("vod", "v/index.m3u8", None, "/cdn/v/index.m3u8")
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "x-cache"), Some("MISS"));
    let advertised: usize = header(&response, "content-length").unwrap().parse().unwrap();

    let body = body_bytes(response).await;
    assert_eq!(advertised, body.len(), "Content-Length must match the rewritten body");

    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.contains("URI=\"http://edge.local:8080/cdn/v/key.php?id=1\""));
    assert!(text.contains("http://edge.local:8080/cdn/v/seg0.ts"));
    assert!(text.contains("http://edge.local:8080/cdn/passthrough?url=https"));
    assert!(!text.contains("\nseg0.ts"));

    // Rewritten output is under the playlist ceiling, so it was cached.
    let cached = h
        .cache
        .get(&cache_key("vod", "v/index.m3u8", None))
        .await
        .expect("rewritten playlist cached");
    assert_eq!(cached.data, body);
}

#[tokio::test]
async fn test_playlist_detected_by_extension_without_content_type() {
    let h = harness(|_| {}).await;
    h.origin.put(
        "vod",
        "v/index.m3u8",
        ScriptedObject::new(sample_media_playlist()),
    );

    let response = h
        .pipeline
        .serve_get("vod", "v/index.m3u8", None, "/cdn/v/index.m3u8")
        .await
        .unwrap();

    let body = body_bytes(response).await;
    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.contains("http://edge.local:8080/cdn/v/seg0.ts"));
}

// =============================================================================
// Cacheable-size boundary
// =============================================================================

#[tokio::test]
async fn test_cacheable_size_boundary() {
    let h = harness(|config| {
        config.cache.max_cacheable_bytes = 1024;
    })
    .await;
    let mut gen = TestDataGenerator::default();

    let exactly = Bytes::from(gen.random_bytes(1024));
    let over = Bytes::from(gen.random_bytes(1025));
    h.origin.put("vod", "fit.bin", ScriptedObject::new(exactly).with_content_type("video/mp4"));
    h.origin.put("vod", "big.bin", ScriptedObject::new(over).with_content_type("video/mp4"));

    let response = h
        .pipeline
        .serve_get("vod", "fit.bin", None, "/cdn/fit.bin")
        .await
        .unwrap();
    body_bytes(response).await;

    let cache = Arc::clone(&h.cache);
    assert!(
        eventually(Duration::from_secs(2), move || {
            let cache = Arc::clone(&cache);
            async move { cache.exists(&cache_key("vod", "fit.bin", None)).await }
        })
        .await,
        "object of exactly the ceiling must be cached"
    );

    let response = h
        .pipeline
        .serve_get("vod", "big.bin", None, "/cdn/big.bin")
        .await
        .unwrap();
    body_bytes(response).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !h.cache.exists(&cache_key("vod", "big.bin", None)).await,
        "object over the ceiling must not be cached"
    );
}

// =============================================================================
// HEAD and error mapping
// =============================================================================

#[tokio::test]
async fn test_head_serves_metadata_without_body() {
    let h = harness(|_| {}).await;
    let payload = Bytes::from_static(b"subtitle data");
    h.origin.put(
        "vod",
        "subs/en.vtt",
        ScriptedObject::new(payload.clone()).with_content_type("text/vtt"),
    );

    let response = h.pipeline.serve_head("vod", "subs/en.vtt").await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "content-type"), Some("text/vtt"));
    assert_eq!(
        header(&response, "content-length"),
        Some(payload.len().to_string().as_str())
    );
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_missing_object_maps_to_not_found() {
    let h = harness(|_| {}).await;

    let err = h
        .pipeline
        .serve_get("vod", "absent.mp4", None, "/cdn/absent.mp4")
        .await
        .expect_err("missing object must error");

    assert_eq!(err.status_code(), 404);
    assert_eq!(err.code(), "not-found");
}

#[tokio::test]
async fn test_generic_content_type_upgraded_by_extension() {
    let h = harness(|_| {}).await;
    h.origin.put(
        "vod",
        "seg/0.ts",
        ScriptedObject::new(vec![0x47u8; 376]).with_content_type("application/octet-stream"),
    );

    let response = h
        .pipeline
        .serve_get("vod", "seg/0.ts", None, "/cdn/seg/0.ts")
        .await
        .unwrap();

    assert_eq!(header(&response, "content-type"), Some("video/mp2t"));
}
