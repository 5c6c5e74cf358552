//! Lock-free 64-bucket logarithmic histogram of per-segment throughput
//! samples (1 KB/s .. 10 GB/s), with atomic drain-and-reset semantics.
//!
//! `Drain` must zero the counters it returns, not merely snapshot them --
//! an aggregator that re-reads without draining would re-merge the same
//! historical counts into its fleet-wide digest on every cycle, producing
//! unbounded weights and drifting percentiles. This is the named
//! regression surface spec.md calls out; `drain_twice_is_idempotent`
//! below is its dedicated test.

use std::sync::atomic::{AtomicU64, Ordering};

pub const BUCKET_COUNT: usize = 64;

/// A drained, point-in-time view of the histogram's buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputSnapshot {
    pub buckets: [u64; BUCKET_COUNT],
    pub count: u64,
    /// Sum of recorded bytes/sec values, truncated to u64 (used for a mean,
    /// not a quantile -- quantiles come from the bucket counts).
    pub sum: u64,
}

impl ThroughputSnapshot {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Approximate midpoint (bytes/sec) of bucket `i`, for weighting a
    /// fleet-wide merge by bucket count.
    pub fn bucket_midpoint(i: usize) -> f64 {
        // bucket i covers [2^i, 2^(i+1)) KB/s; midpoint in bytes/sec.
        let lo_kb = (1u64 << i) as f64;
        let hi_kb = (1u64 << (i + 1)) as f64;
        (lo_kb + hi_kb) / 2.0 * 1024.0
    }
}

pub struct ThroughputHistogram {
    buckets: [AtomicU64; BUCKET_COUNT],
    count: AtomicU64,
    sum: AtomicU64,
    /// Raw bits of an f64, updated via CAS loop (atomic f64 isn't a
    /// primitive on stable Rust).
    max_bits: AtomicU64,
}

impl Default for ThroughputHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max_bits: AtomicU64::new(0),
        }
    }

    fn bucket_index(bytes_per_sec: f64) -> usize {
        if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
            return 0;
        }
        let kb_per_sec = bytes_per_sec / 1024.0;
        if kb_per_sec < 1.0 {
            return 0;
        }
        let bucket = kb_per_sec.log2().floor();
        bucket.clamp(0.0, (BUCKET_COUNT - 1) as f64) as usize
    }

    /// Record one per-segment throughput sample, in bytes/sec.
    pub fn record(&self, bytes_per_sec: f64) {
        if !bytes_per_sec.is_finite() || bytes_per_sec < 0.0 {
            return;
        }
        let idx = Self::bucket_index(bytes_per_sec);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(bytes_per_sec as u64, Ordering::Relaxed);
        self.update_max(bytes_per_sec);
    }

    fn update_max(&self, value: f64) {
        let new_bits = value.to_bits();
        loop {
            let old_bits = self.max_bits.load(Ordering::Relaxed);
            let old_value = f64::from_bits(old_bits);
            if value <= old_value {
                return;
            }
            if self
                .max_bits
                .compare_exchange_weak(old_bits, new_bits, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn max(&self) -> f64 {
        f64::from_bits(self.max_bits.load(Ordering::Relaxed))
    }

    /// Atomically read-and-reset every bucket plus count/sum. This is the
    /// only operation an aggregation cycle should use.
    pub fn drain(&self) -> ThroughputSnapshot {
        let mut buckets = [0u64; BUCKET_COUNT];
        for (i, bucket) in self.buckets.iter().enumerate() {
            buckets[i] = bucket.swap(0, Ordering::Relaxed);
        }
        let count = self.count.swap(0, Ordering::Relaxed);
        let sum = self.sum.swap(0, Ordering::Relaxed);
        ThroughputSnapshot {
            buckets,
            count,
            sum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_twice_is_idempotent() {
        let hist = ThroughputHistogram::new();
        hist.record(5_000_000.0);
        let first = hist.drain();
        assert!(!first.is_empty());

        let second = hist.drain();
        assert!(second.is_empty());
        assert_eq!(second.buckets, [0u64; BUCKET_COUNT]);
    }

    #[test]
    fn drain_sum_of_buckets_equals_record_count() {
        let hist = ThroughputHistogram::new();
        for i in 0..1000u64 {
            hist.record((1024 * (1 + i % 5000)) as f64);
        }
        let snap = hist.drain();
        assert_eq!(snap.count, 1000);
        assert_eq!(snap.buckets.iter().sum::<u64>(), 1000);
    }

    #[test]
    fn negative_and_nan_samples_are_ignored() {
        let hist = ThroughputHistogram::new();
        hist.record(-1.0);
        hist.record(f64::NAN);
        let snap = hist.drain();
        assert_eq!(snap.count, 0);
    }

    #[test]
    fn max_is_monotone_under_cas() {
        let hist = ThroughputHistogram::new();
        hist.record(100.0);
        hist.record(50.0);
        hist.record(9_000.0);
        assert_eq!(hist.max(), 9_000.0);
    }

    #[test]
    fn bucket_index_clamps_at_range_edges() {
        assert_eq!(ThroughputHistogram::bucket_index(0.0), 0);
        assert_eq!(ThroughputHistogram::bucket_index(500.0), 0);
        assert_eq!(
            ThroughputHistogram::bucket_index(10.0 * 1024.0 * 1024.0 * 1024.0),
            BUCKET_COUNT - 1
        );
    }
}
