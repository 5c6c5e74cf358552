//! Exercises `SegmentSizeCache` against a real HTTP server (wiremock),
//! covering the numeric-eviction window (spec.md §8 invariant #3/#4) and
//! the oversize-response guard.

use std::time::Duration;

use hls_loadgen::config::SegmentCacheConfig;
use hls_loadgen::segment_cache::{SegmentSizeCache, SegmentSizeLookup};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cache_config(window_size: usize, max_response_bytes: u64) -> SegmentCacheConfig {
    SegmentCacheConfig {
        scrape_interval: Duration::from_secs(10),
        jitter: Duration::from_millis(0),
        window_size,
        first_scrape_timeout: Duration::from_secs(5),
        max_response_bytes,
    }
}

#[tokio::test]
async fn scrape_populates_lookup_and_evicts_by_window() {
    let server = MockServer::start().await;
    let entries: Vec<_> = (1..=10)
        .map(|i| json!({"name": format!("seg{i}.ts"), "type": "segment", "size": i * 1000, "mtime": "2026-01-01T00:00:00Z"}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/sizes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(entries))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let cache = SegmentSizeCache::new(cache_config(3, 2 * 1024 * 1024), format!("{}/sizes", server.uri()), client);

    let count = cache.scrape_once().await.unwrap();
    assert_eq!(count, 10);

    // Window size 3: only seg8, seg9, seg10 (the three highest-numbered)
    // should remain lookupable.
    assert!(cache.lookup("seg10.ts").is_some());
    assert!(cache.lookup("seg9.ts").is_some());
    assert!(cache.lookup("seg8.ts").is_some());
    assert!(cache.lookup("seg1.ts").is_none());
    assert_eq!(cache.lookup("seg10.ts"), Some(10_000));
}

#[tokio::test]
async fn oversize_response_is_reported_not_silently_truncated() {
    let server = MockServer::start().await;
    let huge_body = "[".to_string() + &"0".repeat(4096) + "]";
    Mock::given(method("GET"))
        .and(path("/sizes"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(huge_body, "application/json"))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    // max_response_bytes smaller than the body forces the cap to trip.
    let cache = SegmentSizeCache::new(cache_config(5, 16), format!("{}/sizes", server.uri()), client);

    assert!(cache.scrape_once().await.is_err());
}

#[tokio::test]
async fn missing_endpoint_is_not_fatal() {
    let server = MockServer::start().await;
    // No mock registered for /sizes: wiremock returns 404.
    let client = reqwest::Client::new();
    let cache = SegmentSizeCache::new(cache_config(5, 1024), format!("{}/sizes", server.uri()), client);

    // A failed scrape surfaces as an error the caller can log and
    // continue past; it must not panic or leave the cache unusable.
    let _ = cache.scrape_once().await;
    assert!(cache.lookup("whatever.ts").is_none());
}
