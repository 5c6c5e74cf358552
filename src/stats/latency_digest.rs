//! Memory-bounded, time-windowed quantile sketch for per-client latency
//! samples.
//!
//! spec.md calls for "a t-digest or equivalent" holding recent samples
//! with time-windowed expiry, O(log C) amortized add/quantile, and
//! memory on the order of 10 KB regardless of sample count. This crate
//! grounds the sketch itself in `hdrhistogram` (see
//! `SachinSSh-rust-redis-bench/src/metrics/collector.rs` in the pack)
//! rather than hand-rolling a t-digest, and gets windowed expiry from a
//! two-generation rotation: a `current` histogram absorbs new samples, a
//! `previous` histogram holds the prior generation, and reads merge both.
//! Rotating every `window / 2` bounds any sample's lifetime to between
//! `window / 2` and `window`, the same bounded-staleness guarantee a
//! filter-and-rebuild t-digest would give, at a fraction of the
//! bookkeeping and with strictly bounded memory (two fixed-precision
//! histograms, not a growing sample list).

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const MIN_WINDOW: Duration = Duration::from_secs(10);
const MAX_WINDOW: Duration = Duration::from_secs(300);

/// Values are recorded in microseconds; cap at one hour to keep the
/// histogram's internal bucket count (and thus memory) small.
const MAX_TRACKABLE_MICROS: u64 = 3_600_000_000;
const SIGFIGS: u8 = 2;

struct Generations {
    current: Histogram<u64>,
    previous: Histogram<u64>,
    rotated_at: Instant,
}

pub struct LatencyDigest {
    window: Duration,
    state: Mutex<Generations>,
}

impl LatencyDigest {
    pub fn new(window: Duration) -> Self {
        let window = window.clamp(MIN_WINDOW, MAX_WINDOW);
        let make = || Histogram::<u64>::new_with_bounds(1, MAX_TRACKABLE_MICROS, SIGFIGS)
            .expect("static histogram bounds are valid");
        Self {
            window,
            state: Mutex::new(Generations {
                current: make(),
                previous: make(),
                rotated_at: Instant::now(),
            }),
        }
    }

    fn maybe_rotate(gens: &mut Generations, window: Duration) {
        if gens.rotated_at.elapsed() >= window / 2 {
            gens.previous.reset();
            std::mem::swap(&mut gens.previous, &mut gens.current);
            gens.rotated_at = Instant::now();
        }
    }

    /// Record one latency sample.
    pub fn add(&self, sample: Duration) {
        let micros = sample.as_micros().min(MAX_TRACKABLE_MICROS as u128) as u64;
        let micros = micros.max(1);
        let mut gens = self.state.lock();
        Self::maybe_rotate(&mut gens, self.window);
        let _ = gens.current.record(micros);
    }

    /// Periodic cleanup hook: forces a generation rotation check without
    /// recording a sample, matching the cleanup-on-a-timer the
    /// aggregator drives independent of traffic volume.
    pub fn cleanup(&self) {
        let mut gens = self.state.lock();
        Self::maybe_rotate(&mut gens, self.window);
    }

    /// Quantile `q` in `[0.0, 1.0]`, merged across both generations so a
    /// sample stays visible for at least `window / 2` after rotation.
    /// Returns `None` if no samples have been recorded within the window.
    pub fn quantile(&self, q: f64) -> Option<Duration> {
        let mut gens = self.state.lock();
        Self::maybe_rotate(&mut gens, self.window);
        if gens.current.is_empty() && gens.previous.is_empty() {
            return None;
        }
        let mut merged = gens.previous.clone();
        merged
            .add(&gens.current)
            .expect("histograms share identical bounds/sigfigs");
        Some(Duration::from_micros(merged.value_at_quantile(q)))
    }

    pub fn sample_count(&self) -> u64 {
        let gens = self.state.lock();
        gens.current.len() + gens.previous.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_has_no_quantiles() {
        let digest = LatencyDigest::new(Duration::from_secs(30));
        assert!(digest.quantile(0.5).is_none());
    }

    #[test]
    fn p50_tracks_uniform_samples() {
        let digest = LatencyDigest::new(Duration::from_secs(60));
        for ms in 1..=100u64 {
            digest.add(Duration::from_millis(ms));
        }
        let p50 = digest.quantile(0.5).unwrap();
        assert!(p50.as_millis() >= 45 && p50.as_millis() <= 55, "{p50:?}");
    }

    #[test]
    fn window_is_clamped_to_boundaries() {
        let digest = LatencyDigest::new(Duration::from_secs(1));
        assert!(digest.window >= MIN_WINDOW);
        let digest = LatencyDigest::new(Duration::from_secs(10_000));
        assert!(digest.window <= MAX_WINDOW);
    }

    #[test]
    fn zero_duration_sample_does_not_panic_or_produce_nan() {
        let digest = LatencyDigest::new(Duration::from_secs(30));
        digest.add(Duration::from_micros(0));
        assert!(digest.quantile(0.5).is_some());
    }
}
