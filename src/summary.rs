//! Exit summary: printed once to stdout after the orchestrator has
//! drained every supervisor, from the same `AggregateStats` snapshot the
//! TUI and the Prometheus adapter read from (spec.md §6).

use crate::aggregator::AggregateStats;

fn fmt_duration(d: std::time::Duration) -> String {
    humantime::format_duration(std::time::Duration::from_secs(d.as_secs())).to_string()
}

fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn fmt_opt_duration(d: Option<std::time::Duration>) -> String {
    match d {
        Some(d) => format!("{:.1}ms", d.as_secs_f64() * 1000.0),
        None => "n/a".to_string(),
    }
}

fn fmt_opt_uptime(d: Option<std::time::Duration>) -> String {
    match d {
        Some(d) => fmt_duration(d),
        None => "n/a".to_string(),
    }
}

/// Prints the run's closing report. Never fails: a missing field just
/// prints as `n/a` rather than aborting shutdown.
pub fn print(stats: &AggregateStats) {
    println!();
    println!("=== hls-loadgen run summary ===");
    println!("run duration:        {}", fmt_duration(stats.generated_at_elapsed));
    println!(
        "clients:             {} active / {} target, {} peak active, {} terminal",
        stats.active_clients, stats.target_clients, stats.peak_active_clients, stats.terminal_clients
    );
    println!(
        "client health:       {} stalled, {} degraded, {} high-drift, {} above realtime",
        stats.stalled_clients, stats.degraded_clients, stats.high_drift_clients, stats.clients_above_realtime
    );
    println!();
    println!("total bytes:         {}", fmt_bytes(stats.total_bytes));
    println!(
        "requests:            {} manifest, {} segment, {} unknown",
        stats.manifest_requests, stats.segment_requests, stats.unknown_requests
    );
    println!("reconnects/timeouts/stalls: {}/{}/{}", stats.reconnects, stats.timeouts, stats.stalls);
    println!();
    println!(
        "manifest latency:    p50 {} p95 {} p99 {}",
        fmt_opt_duration(stats.manifest_latency_p50),
        fmt_opt_duration(stats.manifest_latency_p95),
        fmt_opt_duration(stats.manifest_latency_p99),
    );
    println!(
        "segment latency:     p50 {} p95 {} p99 {}",
        fmt_opt_duration(stats.segment_latency_p50),
        fmt_opt_duration(stats.segment_latency_p95),
        fmt_opt_duration(stats.segment_latency_p99),
    );
    println!(
        "throughput (bps):    p50 {:.0} p95 {:.0} p99 {:.0} max {:.0}",
        stats.throughput_p50, stats.throughput_p95, stats.throughput_p99, stats.throughput_max
    );
    println!(
        "playback speed:      mean {:.3}x, p50 {:.3}x p95 {:.3}x p99 {:.3}x",
        stats.average_speed, stats.speed_p50, stats.speed_p95, stats.speed_p99
    );
    println!(
        "process uptime:      p50 {} p95 {} p99 {}",
        fmt_opt_uptime(stats.uptime_p50),
        fmt_opt_uptime(stats.uptime_p95),
        fmt_opt_uptime(stats.uptime_p99),
    );
    println!(
        "exit classes:        {} clean, {} expected shutdown, {} external kill, {} error",
        stats.exit_clean, stats.exit_expected_shutdown, stats.exit_external_kill, stats.exit_error
    );

    if !stats.rolling_rates.is_empty() {
        println!();
        print!("rolling byte rate:  ");
        for (window, rate) in &stats.rolling_rates {
            print!(" [{}: {:.0} B/s]", fmt_duration(*window), rate);
        }
        println!();
    }

    if !stats.http_errors_by_code.is_empty() {
        println!();
        println!("top HTTP error codes:");
        let mut codes: Vec<_> = stats.http_errors_by_code.iter().collect();
        codes.sort_by(|a, b| b.1.cmp(a.1));
        for (code, count) in codes.into_iter().take(10) {
            println!("  {code}: {count}");
        }
    }

    if stats.degraded_clients > 0 {
        println!();
        println!(
            "WARNING: {} client(s) are degraded (parser drop rate exceeded the configured threshold) -- \
             request/latency/throughput figures above may undercount actual origin traffic.",
            stats.degraded_clients
        );
    }
    println!("================================");
}
