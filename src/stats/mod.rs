//! Per-client statistics engine: atomic counters, gauges, and the
//! bounded-memory sketches (latency digest, throughput histogram) that
//! back the aggregator.

pub mod atomic_f64;
pub mod client;
pub mod latency_digest;
pub mod rolling_rate;
pub mod throughput_histogram;

pub use client::{ClientStats, DetectionThresholds, ExitCounts};
pub use rolling_rate::RollingRateTracker;
