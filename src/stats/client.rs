//! Per-client mutable state: atomic counters and gauges, byte accounting
//! across process restarts, drift/stall detection, and the per-client
//! sketches (`LatencyDigest`, `ThroughputHistogram`, pending segment
//! tracking).
//!
//! Every counter is an atomic scalar updated with a single atomic op;
//! nothing on the write path takes a mutex except the latency digests
//! (briefly, per-sample) and the small maps (`http_errors_by_code`,
//! `pending_segments`) for which the pack has no lock-free map crate
//! available -- contention stays low because writes land every few ms
//! per client and reads happen roughly once per aggregation cycle.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::atomic_f64::AtomicF64;
use super::latency_digest::LatencyDigest;
use super::rolling_rate::RollingRateTracker;
use super::throughput_histogram::ThroughputHistogram;
use crate::config::{DriftDetectionConfig, StallDetectionConfig};
use crate::parser::pipeline::PipelineHealth;
use crate::parser::progress::ProgressUpdate;

const PENDING_SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);
const RECENT_SEGMENT_SIZES_CAP: usize = 64;

/// Thresholds used to classify stalls and high drift. Built once from
/// `Configuration` and shared read-only for the run -- no global state,
/// just an explicitly passed value, per spec.md's design notes.
#[derive(Debug, Clone, Copy)]
pub struct DetectionThresholds {
    pub stall_speed_threshold: f64,
    pub stall_sustained: Duration,
    pub high_drift_threshold: Duration,
}

impl DetectionThresholds {
    pub fn from_config(stall: &StallDetectionConfig, drift: &DriftDetectionConfig) -> Self {
        Self {
            stall_speed_threshold: stall.speed_threshold,
            stall_sustained: stall.sustained_duration,
            high_drift_threshold: drift.high_drift_threshold,
        }
    }
}

struct PendingSegment {
    name: String,
    opened_at: Instant,
}

/// Lifetime exit tally for one client, summed by the aggregator into the
/// fleet-wide exit-code distribution in the exit summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitCounts {
    pub clean: u64,
    pub expected_shutdown: u64,
    pub external_kill: u64,
    pub error: u64,
}

pub struct ClientStats {
    pub client_id: usize,
    thresholds: DetectionThresholds,
    drop_threshold: f64,

    manifest_requests: AtomicU64,
    segment_requests: AtomicU64,
    unknown_requests: AtomicU64,
    reconnects: AtomicU64,
    timeouts: AtomicU64,
    stalls: AtomicU64,
    http_errors_by_code: Mutex<HashMap<u16, u64>>,

    exit_clean: AtomicU64,
    exit_expected_shutdown: AtomicU64,
    exit_external_kill: AtomicU64,
    exit_error: AtomicU64,

    current_speed: AtomicF64,
    current_drift: AtomicF64,
    max_drift: AtomicF64,
    playback_position_us: AtomicI64,

    bytes_from_previous_runs: AtomicU64,
    current_process_bytes: AtomicU64,
    last_total_size: AtomicU64,
    process_started_at: Mutex<Instant>,

    stalled: AtomicBool,
    stall_since: Mutex<Option<Instant>>,
    terminal: AtomicBool,

    pending_segments: Mutex<VecDeque<PendingSegment>>,
    pending_manifests: Mutex<VecDeque<PendingSegment>>,
    recent_segment_sizes: Mutex<VecDeque<u64>>,

    pub manifest_latency: LatencyDigest,
    pub segment_latency: LatencyDigest,
    pub throughput: ThroughputHistogram,
    /// Per-process wall-clock uptime, one sample recorded at each child
    /// exit (spec.md §3's `ChildProcess` uptime attribute).
    pub uptime: LatencyDigest,

    pub progress_health: Arc<PipelineHealth>,
    pub diagnostic_health: Arc<PipelineHealth>,
}

impl ClientStats {
    pub fn new(
        client_id: usize,
        thresholds: DetectionThresholds,
        drop_threshold: f64,
        latency_window: Duration,
    ) -> Self {
        Self {
            client_id,
            thresholds,
            drop_threshold,
            manifest_requests: AtomicU64::new(0),
            segment_requests: AtomicU64::new(0),
            unknown_requests: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            stalls: AtomicU64::new(0),
            http_errors_by_code: Mutex::new(HashMap::new()),
            exit_clean: AtomicU64::new(0),
            exit_expected_shutdown: AtomicU64::new(0),
            exit_external_kill: AtomicU64::new(0),
            exit_error: AtomicU64::new(0),
            current_speed: AtomicF64::new(0.0),
            current_drift: AtomicF64::new(0.0),
            max_drift: AtomicF64::new(0.0),
            playback_position_us: AtomicI64::new(0),
            bytes_from_previous_runs: AtomicU64::new(0),
            current_process_bytes: AtomicU64::new(0),
            last_total_size: AtomicU64::new(0),
            process_started_at: Mutex::new(Instant::now()),
            stalled: AtomicBool::new(false),
            stall_since: Mutex::new(None),
            terminal: AtomicBool::new(false),
            pending_segments: Mutex::new(VecDeque::new()),
            pending_manifests: Mutex::new(VecDeque::new()),
            recent_segment_sizes: Mutex::new(VecDeque::new()),
            manifest_latency: LatencyDigest::new(latency_window),
            segment_latency: LatencyDigest::new(latency_window),
            uptime: LatencyDigest::new(latency_window),
            throughput: ThroughputHistogram::new(),
            progress_health: Arc::new(PipelineHealth::new()),
            diagnostic_health: Arc::new(PipelineHealth::new()),
        }
    }

    // -- byte accounting across restarts --------------------------------

    /// Must be called once, synchronously, before a new child's parsers
    /// start. Rolls the previous process's bytes into the cumulative
    /// total and resets the per-process counters the decoder itself
    /// will reset on its side.
    pub fn on_process_start(&self) {
        let previous = self.current_process_bytes.swap(0, Ordering::Relaxed);
        self.bytes_from_previous_runs
            .fetch_add(previous, Ordering::Relaxed);
        self.last_total_size.store(0, Ordering::Relaxed);
        *self.process_started_at.lock() = Instant::now();
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_from_previous_runs.load(Ordering::Relaxed)
            + self.current_process_bytes.load(Ordering::Relaxed)
    }

    // -- request counters -------------------------------------------------

    pub fn record_manifest_request(&self) {
        self.manifest_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segment_request(&self) {
        self.segment_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_request(&self) {
        self.unknown_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_http_error(&self, code: u16) {
        *self.http_errors_by_code.lock().entry(code).or_insert(0) += 1;
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// A decoder-reported timeout (distinct from a pending-segment sweep
    /// timeout, but both feed the same counter per spec.md's data model).
    pub fn record_timeout(&self) {
        self.record_timeouts(1);
    }

    fn record_timeouts(&self, n: u64) {
        if n > 0 {
            self.timeouts.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn record_exit_clean(&self) {
        self.exit_clean.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_exit_expected_shutdown(&self) {
        self.exit_expected_shutdown.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_exit_external_kill(&self) {
        self.exit_external_kill.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_exit_error(&self) {
        self.exit_error.fetch_add(1, Ordering::Relaxed);
    }
    pub fn exit_counts(&self) -> ExitCounts {
        ExitCounts {
            clean: self.exit_clean.load(Ordering::Relaxed),
            expected_shutdown: self.exit_expected_shutdown.load(Ordering::Relaxed),
            external_kill: self.exit_external_kill.load(Ordering::Relaxed),
            error: self.exit_error.load(Ordering::Relaxed),
        }
    }

    /// Wall-clock time since `on_process_start` was last called; sampled
    /// into `uptime` at each child exit.
    pub fn process_uptime(&self) -> Duration {
        self.process_started_at.lock().elapsed()
    }

    pub fn manifest_requests(&self) -> u64 {
        self.manifest_requests.load(Ordering::Relaxed)
    }
    pub fn segment_requests(&self) -> u64 {
        self.segment_requests.load(Ordering::Relaxed)
    }
    pub fn unknown_requests(&self) -> u64 {
        self.unknown_requests.load(Ordering::Relaxed)
    }
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Relaxed)
    }
    /// Set once, by `ClientSupervisor`, when `max_restarts_per_client` is
    /// reached -- the client will never be respawned again for the rest
    /// of the run.
    pub fn mark_terminal(&self) {
        self.terminal.store(true, Ordering::Relaxed);
    }
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Relaxed)
    }
    pub fn http_errors_snapshot(&self) -> HashMap<u16, u64> {
        self.http_errors_by_code.lock().clone()
    }
    pub fn current_speed(&self) -> f64 {
        self.current_speed.load()
    }
    pub fn current_drift(&self) -> f64 {
        self.current_drift.load()
    }
    pub fn max_drift(&self) -> f64 {
        self.max_drift.load()
    }
    pub fn is_high_drift(&self) -> bool {
        self.current_drift() >= self.thresholds.high_drift_threshold.as_secs_f64()
    }
    pub fn is_degraded(&self) -> bool {
        self.progress_health.drop_rate() > self.drop_threshold
            || self.diagnostic_health.drop_rate() > self.drop_threshold
    }
    pub fn pending_segment_count(&self) -> usize {
        self.pending_segments.lock().len()
    }

    // -- pending segment/manifest requests --------------------------------

    fn open(queue: &Mutex<VecDeque<PendingSegment>>, name: String) {
        queue.lock().push_back(PendingSegment {
            name,
            opened_at: Instant::now(),
        });
    }

    /// FIFO-completes the oldest pending entry if it differs from
    /// `new_name`, returning its wall time. A repeated open of the same
    /// name (decoder re-announcing a request it's still fetching) is not
    /// a completion.
    fn complete_oldest_if_different(
        queue: &Mutex<VecDeque<PendingSegment>>,
        new_name: &str,
    ) -> Option<Duration> {
        let mut pending = queue.lock();
        let is_different = pending.front().map(|p| p.name != new_name).unwrap_or(false);
        if is_different {
            pending.pop_front().map(|p| p.opened_at.elapsed())
        } else {
            None
        }
    }

    pub fn open_segment(&self, name: String) {
        Self::open(&self.pending_segments, name);
    }

    pub fn complete_oldest_segment_if_different(&self, new_name: &str) -> Option<Duration> {
        Self::complete_oldest_if_different(&self.pending_segments, new_name)
    }

    pub fn open_manifest(&self, name: String) {
        Self::open(&self.pending_manifests, name);
    }

    pub fn complete_oldest_manifest_if_different(&self, new_name: &str) -> Option<Duration> {
        Self::complete_oldest_if_different(&self.pending_manifests, new_name)
    }

    /// Sweeps entries older than the fixed 60s pending-segment timeout,
    /// incrementing `timeouts` by the number swept. Manifests are not
    /// swept: only segment completions feed the throughput/latency path
    /// that the 60s staleness guard exists to protect.
    pub fn sweep_stale_pending(&self) {
        let mut pending = self.pending_segments.lock();
        let before = pending.len();
        pending.retain(|p| p.opened_at.elapsed() < PENDING_SEGMENT_TIMEOUT);
        let swept = before - pending.len();
        drop(pending);
        self.record_timeouts(swept as u64);
    }

    fn push_recent_segment_size(&self, size: u64) {
        let mut sizes = self.recent_segment_sizes.lock();
        sizes.push_back(size);
        while sizes.len() > RECENT_SEGMENT_SIZES_CAP {
            sizes.pop_front();
        }
    }

    pub fn recent_segment_sizes(&self) -> Vec<u64> {
        self.recent_segment_sizes.lock().iter().copied().collect()
    }

    // -- progress update application --------------------------------------

    /// Implements spec.md §4.3's `ApplyProgressUpdate` contract.
    pub fn apply_progress_update(&self, u: &ProgressUpdate, rolling_rate: &RollingRateTracker) {
        let previous_total = self.last_total_size.swap(u.total_size, Ordering::Relaxed);
        if previous_total > 0 && u.total_size > previous_total {
            self.push_recent_segment_size(u.total_size - previous_total);
        }
        let delta = u.total_size.saturating_sub(previous_total);
        self.current_process_bytes
            .store(u.total_size, Ordering::Relaxed);
        rolling_rate.record_delta(delta);

        self.update_speed_and_stall(u.speed);
        self.update_drift(u.out_time_us);
        self.sweep_stale_pending();
    }

    fn update_speed_and_stall(&self, speed: f64) {
        self.current_speed.store(speed);
        if speed < self.thresholds.stall_speed_threshold {
            let mut since = self.stall_since.lock();
            let started = *since.get_or_insert_with(Instant::now);
            if started.elapsed() >= self.thresholds.stall_sustained
                && !self.stalled.swap(true, Ordering::Relaxed)
            {
                self.stalls.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            *self.stall_since.lock() = None;
            self.stalled.store(false, Ordering::Relaxed);
        }
    }

    fn update_drift(&self, out_time_us: i64) {
        self.playback_position_us.store(out_time_us, Ordering::Relaxed);
        let elapsed = self.process_started_at.lock().elapsed().as_secs_f64();
        let playback_secs = out_time_us as f64 / 1_000_000.0;
        let drift = (elapsed - playback_secs).max(0.0);
        self.current_drift.store(drift);
        self.max_drift.fetch_max(drift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriftDetectionConfig, StallDetectionConfig};

    fn thresholds() -> DetectionThresholds {
        DetectionThresholds::from_config(
            &StallDetectionConfig {
                speed_threshold: 1.0,
                sustained_duration: Duration::from_millis(10),
            },
            &DriftDetectionConfig {
                high_drift_threshold: Duration::from_secs(5),
            },
        )
    }

    fn stats() -> ClientStats {
        ClientStats::new(0, thresholds(), 0.01, Duration::from_secs(30))
    }

    #[test]
    fn total_bytes_survives_restart_monotonically() {
        let stats = stats();
        let rate = RollingRateTracker::new(64);
        stats.apply_progress_update(
            &ProgressUpdate {
                total_size: 1_000,
                out_time_us: 1_000_000,
                speed: 1.0,
                bitrate: String::new(),
                ended: false,
            },
            &rate,
        );
        assert_eq!(stats.total_bytes(), 1_000);

        // Decoder restarts: total_size resets to 0 on the wire.
        stats.on_process_start();
        assert_eq!(stats.total_bytes(), 1_000, "bytes must not drop on restart");

        stats.apply_progress_update(
            &ProgressUpdate {
                total_size: 500,
                out_time_us: 500_000,
                speed: 1.0,
                bitrate: String::new(),
                ended: false,
            },
            &rate,
        );
        assert_eq!(stats.total_bytes(), 1_500);
    }

    #[test]
    fn zero_out_time_does_not_produce_negative_infinite_drift() {
        let stats = stats();
        stats.update_drift(0);
        assert!(stats.current_drift().is_finite());
        assert!(stats.current_drift() >= 0.0);
    }

    #[test]
    fn stall_increments_once_per_transition() {
        let stats = stats();
        stats.update_speed_and_stall(0.1);
        std::thread::sleep(Duration::from_millis(20));
        stats.update_speed_and_stall(0.1);
        stats.update_speed_and_stall(0.1);
        assert_eq!(stats.stalls(), 1);
        stats.update_speed_and_stall(1.5);
        assert!(!stats.is_stalled());
    }

    #[test]
    fn pending_segment_fifo_completion() {
        let stats = stats();
        stats.open_segment("seg1.ts".into());
        stats.open_segment("seg2.ts".into());
        assert!(stats.complete_oldest_segment_if_different("seg1.ts").is_none());
        let wall_time = stats.complete_oldest_segment_if_different("seg2.ts");
        assert!(wall_time.is_some());
        assert_eq!(stats.pending_segment_count(), 1);
    }

    #[test]
    fn terminal_flag_is_set_once_and_sticks() {
        let stats = stats();
        assert!(!stats.is_terminal());
        stats.mark_terminal();
        assert!(stats.is_terminal());
    }

    #[test]
    fn exit_counts_tally_each_class_independently() {
        let stats = stats();
        stats.record_exit_clean();
        stats.record_exit_clean();
        stats.record_exit_external_kill();
        let counts = stats.exit_counts();
        assert_eq!(counts.clean, 2);
        assert_eq!(counts.external_kill, 1);
        assert_eq!(counts.expected_shutdown, 0);
        assert_eq!(counts.error, 0);
    }
}
