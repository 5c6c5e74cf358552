//! Background fetcher of the origin's segment-size directory listing.
//!
//! Grounded in the teacher's periodic-scrape shape (a reusable interval
//! timer rather than a fresh one per tick) and in `reqwest` usage already
//! present in its dependency tree; the concurrent map is `parking_lot`,
//! consistent with every other shared-state type in this crate, since the
//! pack carries no lock-free map crate for this to reach for instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use serde::Deserialize;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SegmentCacheConfig;
use crate::errors::{CoreError, CoreResult};
use crate::parser::segment_number::parse_segment_number;

#[derive(Debug, Clone, Deserialize)]
struct OriginEntry {
    name: String,
    #[allow(dead_code)]
    r#type: String,
    size: u64,
    #[allow(dead_code)]
    #[serde(default)]
    mtime: String,
}

/// The capability `DiagnosticStreamParser` needs; kept small so a test
/// stub can implement it without spinning up the HTTP scraper.
pub trait SegmentSizeLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<u64>;
}

struct CacheEntry {
    size: u64,
    number: Option<u64>,
}

pub struct SegmentSizeCache {
    config: SegmentCacheConfig,
    manifest_url: String,
    http_client: reqwest::Client,
    entries: RwLock<HashMap<String, CacheEntry>>,
    highest_seen: RwLock<Option<u64>>,
}

impl SegmentSizeCache {
    pub fn new(config: SegmentCacheConfig, endpoint: String, http_client: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            config,
            manifest_url: endpoint,
            http_client,
            entries: RwLock::new(HashMap::new()),
            highest_seen: RwLock::new(None),
        })
    }

    /// Runs the scrape loop until `cancel` fires. Returns once the caller
    /// observes cancellation; the orchestrator spawns this as its own task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let wait = jittered_wait(self.config.scrape_interval, self.config.jitter);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            match self.scrape_once().await {
                Ok(count) => debug!(count, "segment size cache scrape complete"),
                Err(e) => warn!(error = %e, "segment size cache scrape failed"),
            }
        }
    }

    /// Performs one scrape-parse-upsert-evict cycle; used both by `run`
    /// and directly by the orchestrator for the blocking first-scrape.
    pub async fn scrape_once(&self) -> CoreResult<usize> {
        let response = self
            .http_client
            .get(&self.manifest_url)
            .send()
            .await
            .map_err(|e| CoreError::ScrapeFailed(e.to_string()))?;

        let limit = self.config.max_response_bytes;
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CoreError::ScrapeFailed(e.to_string()))?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(CoreError::ScrapeResponseTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        let parsed: Vec<OriginEntry> = serde_json::from_slice(&body)
            .map_err(|e| CoreError::ScrapeFailed(format!("invalid JSON body: {e}")))?;

        self.upsert_and_evict(parsed);
        Ok(self.entries.read().len())
    }

    fn upsert_and_evict(&self, parsed: Vec<OriginEntry>) {
        let mut entries = self.entries.write();
        let mut highest = self.highest_seen.write();

        for item in parsed {
            let number = parse_segment_number(&item.name);
            if let Some(n) = number {
                *highest = Some(highest.map_or(n, |h| h.max(n)));
            }
            entries.insert(
                item.name.clone(),
                CacheEntry {
                    size: item.size,
                    number,
                },
            );
        }

        if let Some(highest) = *highest {
            let window = self.config.window_size as u64;
            let threshold = highest.saturating_sub(window) + 1;
            entries.retain(|_, entry| match entry.number {
                Some(n) => n >= threshold,
                None => true, // manifests are never evicted
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SegmentSizeLookup for SegmentSizeCache {
    fn lookup(&self, name: &str) -> Option<u64> {
        self.entries.read().get(name).map(|e| e.size)
    }
}

/// `interval + U[-jitter, +jitter]`, using a per-call random generator
/// (not a shared global) so concurrent caches don't contend on one RNG's
/// lock and don't dogpile the origin in lockstep. The draw is signed, so
/// the actual wait can land anywhere in `[interval - jitter, interval +
/// jitter]`, not just at or above `interval`.
fn jittered_wait(interval: Duration, jitter: Duration) -> Duration {
    let magnitude = jitter.as_secs_f64();
    let delta = if magnitude > 0.0 {
        rand::thread_rng().gen_range(-magnitude..=magnitude)
    } else {
        0.0
    };
    let wait = (interval.as_secs_f64() + delta).max(0.0);
    Duration::try_from_secs_f64(wait).unwrap_or(interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_entries(entries: Vec<(&str, u64, Option<u64>)>) -> SegmentSizeCache {
        let cache = SegmentSizeCache {
            config: SegmentCacheConfig {
                scrape_interval: Duration::from_secs(10),
                jitter: Duration::from_secs(1),
                window_size: 3,
                first_scrape_timeout: Duration::from_secs(5),
                max_response_bytes: 2 * 1024 * 1024,
            },
            manifest_url: "http://unused.invalid".into(),
            http_client: reqwest::Client::new(),
            entries: RwLock::new(HashMap::new()),
            highest_seen: RwLock::new(None),
        };
        for (name, size, number) in entries {
            cache
                .entries
                .write()
                .insert(name.to_string(), CacheEntry { size, number });
            if let Some(n) = number {
                let mut highest = cache.highest_seen.write();
                *highest = Some(highest.map_or(n, |h| h.max(n)));
            }
        }
        cache
    }

    #[test]
    fn eviction_keeps_exactly_window_size_numbered_entries() {
        let cache = cache_with_entries(vec![
            ("seg1.ts", 10, Some(1)),
            ("seg2.ts", 10, Some(2)),
            ("seg3.ts", 10, Some(3)),
            ("seg4.ts", 10, Some(4)),
            ("seg5.ts", 10, Some(5)),
        ]);
        cache.upsert_and_evict(vec![]); // trigger eviction with no new data
        let entries = cache.entries.read();
        let numbered: Vec<_> = entries.values().filter(|e| e.number.is_some()).collect();
        assert_eq!(numbered.len(), 3);
        assert!(entries.contains_key("seg5.ts"));
        assert!(entries.contains_key("seg4.ts"));
        assert!(entries.contains_key("seg3.ts"));
        assert!(!entries.contains_key("seg1.ts"));
    }

    #[test]
    fn manifest_entries_are_never_evicted() {
        let cache = cache_with_entries(vec![
            ("master.m3u8", 500, None),
            ("seg1.ts", 10, Some(1)),
            ("seg2.ts", 10, Some(2)),
            ("seg3.ts", 10, Some(3)),
            ("seg4.ts", 10, Some(4)),
        ]);
        cache.upsert_and_evict(vec![]);
        assert!(cache.entries.read().contains_key("master.m3u8"));
    }

    #[test]
    fn window_size_one_keeps_only_the_highest() {
        let cache = cache_with_entries(vec![
            ("seg1.ts", 10, Some(1)),
            ("seg2.ts", 10, Some(2)),
        ]);
        {
            let mut entries = cache.entries.write();
            entries.get_mut("seg1.ts").unwrap(); // no-op, keep borrow shape simple
        }
        let mut config = cache.config.clone();
        config.window_size = 1;
        let cache = SegmentSizeCache { config, ..cache };
        cache.upsert_and_evict(vec![]);
        let entries = cache.entries.read();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("seg2.ts"));
    }

    #[test]
    fn lookup_returns_none_for_unknown_name() {
        let cache = cache_with_entries(vec![("seg1.ts", 10, Some(1))]);
        assert_eq!(cache.lookup("seg1.ts"), Some(10));
        assert_eq!(cache.lookup("missing.ts"), None);
    }

    #[test]
    fn jittered_wait_can_land_below_the_base_interval() {
        let interval = Duration::from_secs(10);
        let jitter = Duration::from_secs(2);
        let mut saw_below = false;
        for _ in 0..500 {
            let wait = jittered_wait(interval, jitter);
            assert!(wait >= Duration::from_secs(8));
            assert!(wait <= Duration::from_secs(12));
            if wait < interval {
                saw_below = true;
            }
        }
        assert!(saw_below, "signed jitter should sometimes shorten the wait");
    }

    #[test]
    fn zero_jitter_returns_the_interval_unchanged() {
        let interval = Duration::from_secs(5);
        assert_eq!(jittered_wait(interval, Duration::ZERO), interval);
    }
}
