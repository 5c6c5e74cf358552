//! A `f64` gauge backed by an `AtomicU64` bit pattern.
//!
//! Atomic floats aren't a primitive on stable Rust; this is the same CAS
//! trick spec.md's "Max-throughput CAS" note describes, generalized to
//! plain store/load as well as compare-and-max, reused by every gauge in
//! `ClientStats` (current_speed, current_drift, max_drift, ...).

use std::sync::atomic::{AtomicU64, Ordering};

pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Compare-and-max: updates the stored value only if `value` is
    /// greater than the current one. Retries on CAS races.
    pub fn fetch_max(&self, value: f64) {
        loop {
            let old_bits = self.bits.load(Ordering::Relaxed);
            let old_value = f64::from_bits(old_bits);
            if value <= old_value {
                return;
            }
            if self
                .bits
                .compare_exchange_weak(old_bits, value.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_store_round_trip() {
        let g = AtomicF64::new(1.5);
        assert_eq!(g.load(), 1.5);
        g.store(-3.25);
        assert_eq!(g.load(), -3.25);
    }

    #[test]
    fn fetch_max_only_increases() {
        let g = AtomicF64::new(5.0);
        g.fetch_max(3.0);
        assert_eq!(g.load(), 5.0);
        g.fetch_max(9.0);
        assert_eq!(g.load(), 9.0);
    }
}
