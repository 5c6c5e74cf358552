//! Fixed-capacity ring of (timestamp, cumulative-bytes) samples exposing
//! rolling averages over configured windows plus a lifetime average.
//!
//! Shared fleet-wide (one instance, not one per client) -- every parser
//! feeds byte deltas into the same tracker, per spec.md's "Shared
//! resource policy" and "Global state" notes: a single instance is held
//! by the orchestrator and passed down explicitly, never a process-wide
//! static.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Sample {
    at: Instant,
    cumulative_bytes: u64,
}

pub struct RollingRateTracker {
    capacity: usize,
    samples: Mutex<VecDeque<Sample>>,
    start: Instant,
}

impl RollingRateTracker {
    /// `capacity` bounds the ring regardless of sample rate; callers
    /// should size it generously relative to expected feed frequency
    /// versus the longest configured window.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            start: Instant::now(),
        }
    }

    /// Feed a non-negative byte delta (bytes received since the last
    /// call). Deltas are summed into a running cumulative total so that
    /// `rate` can be computed from two cumulative readings.
    pub fn record_delta(&self, delta: u64) {
        let mut samples = self.samples.lock();
        let cumulative_bytes = samples.back().map(|s| s.cumulative_bytes).unwrap_or(0) + delta;
        samples.push_back(Sample {
            at: Instant::now(),
            cumulative_bytes,
        });
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.samples
            .lock()
            .back()
            .map(|s| s.cumulative_bytes)
            .unwrap_or(0)
    }

    /// Average bytes/sec over the trailing `window`. Uses the oldest
    /// retained sample within the window as the rate anchor; if no
    /// sample is that old yet, anchors at the earliest sample recorded
    /// (a shorter, but still valid, effective window).
    pub fn rate(&self, window: Duration) -> f64 {
        let samples = self.samples.lock();
        let Some(latest) = samples.back() else {
            return 0.0;
        };
        let cutoff = latest.at.checked_sub(window).unwrap_or(self.start);
        let anchor = samples
            .iter()
            .find(|s| s.at >= cutoff)
            .or_else(|| samples.front());
        let Some(anchor) = anchor else {
            return 0.0;
        };
        let elapsed = latest.at.saturating_duration_since(anchor.at);
        if elapsed.is_zero() {
            return 0.0;
        }
        let bytes = latest.cumulative_bytes.saturating_sub(anchor.cumulative_bytes);
        bytes as f64 / elapsed.as_secs_f64()
    }

    pub fn lifetime_average(&self) -> f64 {
        let elapsed = self.start.elapsed();
        if elapsed.is_zero() {
            return 0.0;
        }
        self.total_bytes() as f64 / elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn total_bytes_is_monotone() {
        let tracker = RollingRateTracker::new(16);
        let mut last = 0u64;
        for delta in [10, 0, 25, 5] {
            tracker.record_delta(delta);
            let total = tracker.total_bytes();
            assert!(total >= last);
            last = total;
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let tracker = RollingRateTracker::new(4);
        for _ in 0..100 {
            tracker.record_delta(1);
        }
        assert!(tracker.samples.lock().len() <= 4);
    }

    #[test]
    fn empty_tracker_has_zero_rate() {
        let tracker = RollingRateTracker::new(16);
        assert_eq!(tracker.rate(Duration::from_secs(1)), 0.0);
        assert_eq!(tracker.lifetime_average(), 0.0);
    }

    #[test]
    fn rate_reflects_recent_throughput() {
        let tracker = RollingRateTracker::new(1024);
        for _ in 0..5 {
            tracker.record_delta(1_000_000);
            sleep(Duration::from_millis(5));
        }
        let rate = tracker.rate(Duration::from_secs(300));
        assert!(rate > 0.0);
    }
}
