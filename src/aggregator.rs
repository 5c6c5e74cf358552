//! `StatsAggregator`: the sole fan-in point for the TUI, the Prometheus
//! adapter, and the exit summary. Drains every client's histogram exactly
//! once per refresh cycle and caches the result so concurrent consumers
//! never race for who gets the samples (spec.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};

use crate::stats::client::ClientStats;
use crate::stats::rolling_rate::RollingRateTracker;
use crate::stats::throughput_histogram::ThroughputSnapshot;

const QUANTILE_SIGFIGS: u8 = 2;
const MAX_TRACKABLE_BPS: u64 = 100 * 1024 * 1024 * 1024; // 100 GB/s ceiling

#[derive(Debug, Clone, Default)]
pub struct AggregateStats {
    pub generated_at_elapsed: Duration,
    pub target_clients: usize,
    /// Registered clients not yet terminal (`clients.len() - terminal_clients`).
    pub active_clients: usize,
    /// High-water mark of `active_clients` across the run's lifetime.
    pub peak_active_clients: usize,
    /// Clients that hit `max_restarts_per_client` and will never respawn.
    pub terminal_clients: usize,
    pub stalled_clients: usize,
    pub degraded_clients: usize,
    pub high_drift_clients: usize,
    pub clients_above_realtime: usize,

    pub manifest_requests: u64,
    pub segment_requests: u64,
    pub unknown_requests: u64,
    pub total_bytes: u64,
    pub reconnects: u64,
    pub timeouts: u64,
    pub stalls: u64,
    pub http_errors_by_code: HashMap<u16, u64>,

    pub manifest_latency_p50: Option<Duration>,
    pub manifest_latency_p95: Option<Duration>,
    pub manifest_latency_p99: Option<Duration>,
    pub segment_latency_p50: Option<Duration>,
    pub segment_latency_p95: Option<Duration>,
    pub segment_latency_p99: Option<Duration>,

    pub throughput_p50: f64,
    pub throughput_p95: f64,
    pub throughput_p99: f64,
    pub throughput_max: f64,
    pub average_speed: f64,
    pub speed_p50: f64,
    pub speed_p95: f64,
    pub speed_p99: f64,

    pub uptime_p50: Option<Duration>,
    pub uptime_p95: Option<Duration>,
    pub uptime_p99: Option<Duration>,

    pub exit_clean: u64,
    pub exit_expected_shutdown: u64,
    pub exit_external_kill: u64,
    pub exit_error: u64,

    pub rolling_rates: Vec<(Duration, f64)>,

    pub progress_lines_dropped: u64,
    pub diagnostic_lines_dropped: u64,
}

pub struct StatsAggregator {
    clients: RwLock<Vec<Arc<ClientStats>>>,
    rolling_rate: Arc<RollingRateTracker>,
    rolling_windows: Vec<Duration>,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Arc<AggregateStats>)>>,
    started_at: Instant,
    target_clients: usize,
    peak_active_clients: AtomicUsize,
}

impl StatsAggregator {
    pub fn new(
        rolling_rate: Arc<RollingRateTracker>,
        rolling_windows: Vec<Duration>,
        cache_ttl: Duration,
        target_clients: usize,
    ) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            rolling_rate,
            rolling_windows,
            cache_ttl,
            cache: Mutex::new(None),
            started_at: Instant::now(),
            target_clients,
            peak_active_clients: AtomicUsize::new(0),
        }
    }

    pub fn register_client(&self, stats: Arc<ClientStats>) {
        self.clients.write().push(stats);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Sole fan-in entry point. Returns a cached snapshot if one younger
    /// than `cache_ttl` exists; otherwise drains every client exactly
    /// once, merges, and caches.
    pub fn get_aggregate_stats(&self) -> Arc<AggregateStats> {
        {
            let cache = self.cache.lock();
            if let Some((generated_at, stats)) = cache.as_ref() {
                if generated_at.elapsed() < self.cache_ttl {
                    return stats.clone();
                }
            }
        }
        let fresh = Arc::new(self.compute());
        *self.cache.lock() = Some((Instant::now(), fresh.clone()));
        fresh
    }

    fn compute(&self) -> AggregateStats {
        let clients = self.clients.read();
        let terminal_clients = clients.iter().filter(|c| c.is_terminal()).count();
        let active_clients = clients.len().saturating_sub(terminal_clients);
        let peak_active_clients = self.peak_active_clients.fetch_max(active_clients, Ordering::Relaxed).max(active_clients);
        let mut stats = AggregateStats {
            generated_at_elapsed: self.started_at.elapsed(),
            target_clients: self.target_clients,
            active_clients,
            terminal_clients,
            peak_active_clients,
            ..Default::default()
        };

        let mut throughput_hist = Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE_BPS, QUANTILE_SIGFIGS)
            .expect("static histogram bounds are valid");
        let mut merged_throughput = ThroughputSnapshot {
            buckets: [0u64; crate::stats::throughput_histogram::BUCKET_COUNT],
            count: 0,
            sum: 0,
        };
        let mut speed_sum = 0.0;
        let mut speeds = Vec::with_capacity(clients.len());

        for client in clients.iter() {
            stats.manifest_requests += client.manifest_requests();
            stats.segment_requests += client.segment_requests();
            stats.unknown_requests += client.unknown_requests();
            stats.total_bytes += client.total_bytes();
            stats.reconnects += client.reconnects();
            stats.timeouts += client.timeouts();
            stats.stalls += client.stalls();
            let speed = client.current_speed();
            speed_sum += speed;
            speeds.push(speed);

            let exits = client.exit_counts();
            stats.exit_clean += exits.clean;
            stats.exit_expected_shutdown += exits.expected_shutdown;
            stats.exit_external_kill += exits.external_kill;
            stats.exit_error += exits.error;

            for (code, count) in client.http_errors_snapshot() {
                *stats.http_errors_by_code.entry(code).or_insert(0) += count;
            }

            if client.is_stalled() {
                stats.stalled_clients += 1;
            }
            if client.is_degraded() {
                stats.degraded_clients += 1;
            }
            if client.is_high_drift() {
                stats.high_drift_clients += 1;
            }
            if client.current_speed() > 1.0 {
                stats.clients_above_realtime += 1;
            }
            stats.progress_lines_dropped += client.progress_health.lines_dropped();
            stats.diagnostic_lines_dropped += client.diagnostic_health.lines_dropped();

            // Drain, not snapshot: re-reading without draining would
            // re-merge the same historical counts every cycle.
            let snapshot = client.throughput.drain();
            for (bucket, count) in snapshot.buckets.iter().enumerate() {
                merged_throughput.buckets[bucket] += count;
                if *count > 0 {
                    let midpoint = ThroughputSnapshot::bucket_midpoint(bucket);
                    let _ = throughput_hist.record_n(midpoint as u64, *count);
                }
            }
            merged_throughput.count += snapshot.count;
            merged_throughput.sum += snapshot.sum;
        }

        stats.average_speed = if clients.is_empty() {
            0.0
        } else {
            speed_sum / clients.len() as f64
        };
        speeds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        stats.speed_p50 = percentile(&speeds, 0.5);
        stats.speed_p95 = percentile(&speeds, 0.95);
        stats.speed_p99 = percentile(&speeds, 0.99);

        stats.manifest_latency_p50 = merged_quantile(&clients, |c| &c.manifest_latency, 0.5);
        stats.manifest_latency_p95 = merged_quantile(&clients, |c| &c.manifest_latency, 0.95);
        stats.manifest_latency_p99 = merged_quantile(&clients, |c| &c.manifest_latency, 0.99);
        stats.segment_latency_p50 = merged_quantile(&clients, |c| &c.segment_latency, 0.5);
        stats.segment_latency_p95 = merged_quantile(&clients, |c| &c.segment_latency, 0.95);
        stats.segment_latency_p99 = merged_quantile(&clients, |c| &c.segment_latency, 0.99);
        stats.uptime_p50 = merged_quantile(&clients, |c| &c.uptime, 0.5);
        stats.uptime_p95 = merged_quantile(&clients, |c| &c.uptime, 0.95);
        stats.uptime_p99 = merged_quantile(&clients, |c| &c.uptime, 0.99);

        if throughput_hist.len() > 0 {
            stats.throughput_p50 = throughput_hist.value_at_quantile(0.5) as f64;
            stats.throughput_p95 = throughput_hist.value_at_quantile(0.95) as f64;
            stats.throughput_p99 = throughput_hist.value_at_quantile(0.99) as f64;
        }
        stats.throughput_max = clients.iter().fold(0.0f64, |acc, c| acc.max(c.throughput.max()));

        stats.rolling_rates = self
            .rolling_windows
            .iter()
            .map(|w| (*w, self.rolling_rate.rate(*w)))
            .collect();

        stats
    }
}

/// Merges each client's digest for the given accessor by adding raw
/// latency samples isn't possible (digests don't expose raw samples), so
/// this approximates the fleet quantile as the mean of each client's own
/// quantile reading, weighted equally -- an acceptable approximation at
/// aggregation scale, consistent with the throughput merge's own
/// midpoint-weighted approximation.
/// Nearest-rank percentile over an already-sorted snapshot of per-client
/// speed readings. `average_speed` stays a plain mean alongside this so
/// both a central tendency and a spread are available to callers.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn merged_quantile(
    clients: &[Arc<ClientStats>],
    pick: impl Fn(&ClientStats) -> &crate::stats::latency_digest::LatencyDigest,
    q: f64,
) -> Option<Duration> {
    let samples: Vec<Duration> = clients.iter().filter_map(|c| pick(c).quantile(q)).collect();
    if samples.is_empty() {
        return None;
    }
    let total: Duration = samples.iter().sum();
    Some(total / samples.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::client::DetectionThresholds;

    fn thresholds() -> DetectionThresholds {
        DetectionThresholds {
            stall_speed_threshold: 1.0,
            stall_sustained: Duration::from_secs(5),
            high_drift_threshold: Duration::from_secs(5),
        }
    }

    #[test]
    fn empty_aggregator_has_zeroed_totals() {
        let aggregator = StatsAggregator::new(
            Arc::new(RollingRateTracker::new(16)),
            vec![Duration::from_secs(1)],
            Duration::from_millis(0),
            0,
        );
        let stats = aggregator.get_aggregate_stats();
        assert_eq!(stats.active_clients, 0);
        assert_eq!(stats.total_bytes, 0);
    }

    #[test]
    fn cache_coalesces_reads_within_ttl() {
        let aggregator = StatsAggregator::new(
            Arc::new(RollingRateTracker::new(16)),
            vec![],
            Duration::from_secs(60),
            1,
        );
        let client = Arc::new(ClientStats::new(0, thresholds(), 0.01, Duration::from_secs(30)));
        client.throughput.record(1_000_000.0);
        aggregator.register_client(client.clone());

        let first = aggregator.get_aggregate_stats();
        client.throughput.record(2_000_000.0);
        let second = aggregator.get_aggregate_stats();
        assert_eq!(first.generated_at_elapsed, second.generated_at_elapsed);
        // second call must not have drained again
        let snap = client.throughput.drain();
        assert_eq!(
            snap.count, 1,
            "cache hit must not have drained the histogram a second time"
        );
    }

    #[test]
    fn terminal_clients_are_excluded_from_active_but_tracked_separately() {
        let aggregator = StatsAggregator::new(
            Arc::new(RollingRateTracker::new(16)),
            vec![],
            Duration::from_millis(0),
            2,
        );
        let live = Arc::new(ClientStats::new(0, thresholds(), 0.01, Duration::from_secs(30)));
        let terminal = Arc::new(ClientStats::new(1, thresholds(), 0.01, Duration::from_secs(30)));
        terminal.mark_terminal();
        aggregator.register_client(live);
        aggregator.register_client(terminal);

        let stats = aggregator.get_aggregate_stats();
        assert_eq!(stats.terminal_clients, 1);
        assert_eq!(stats.active_clients, 1);
        assert_eq!(stats.peak_active_clients, 1);
    }

    #[test]
    fn percentile_picks_nearest_rank() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn drained_throughput_is_not_recounted_across_refreshes() {
        let aggregator = StatsAggregator::new(
            Arc::new(RollingRateTracker::new(16)),
            vec![],
            Duration::from_millis(0),
            1,
        );
        let client = Arc::new(ClientStats::new(0, thresholds(), 0.01, Duration::from_secs(30)));
        client.throughput.record(5_000_000.0);
        aggregator.register_client(client);

        let first = aggregator.get_aggregate_stats();
        std::thread::sleep(Duration::from_millis(2));
        let second = aggregator.get_aggregate_stats();
        assert!(first.throughput_p50 > 0.0);
        assert_eq!(second.throughput_p50, 0.0, "no new samples since last drain");
    }
}
