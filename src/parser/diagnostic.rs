//! Parses the decoder's freeform diagnostic log stream: URL opens, HTTP
//! errors, reconnects, timeouts, and (by correlating with
//! `pending_segments`) inferred per-segment/per-manifest wall-times.
//!
//! Pattern recognition follows the plain substring-scanning style of
//! `hua0512-rust-srec`'s `ffmpeg_parser::parse_opened_path` /
//! `is_segment_start` (`line.find(...)`-based, no regex) rather than a
//! compiled regex -- these are single-pass single-line scans on a hot
//! path, and the teacher's own parser reaches for `str::find` there, not
//! `regex`.

use std::time::Duration;

use tracing::debug;

use crate::segment_cache::SegmentSizeLookup;
use crate::stats::client::ClientStats;

/// Below this wall-time a throughput sample is suppressed: segments
/// observed back-to-back at process startup can otherwise appear to
/// complete in a handful of microseconds, producing nonsensical spikes.
const MIN_WALL_TIME_FOR_THROUGHPUT: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UrlKind {
    Manifest,
    Segment,
    Init,
    Unknown,
}

fn classify(url: &str) -> UrlKind {
    let basename = crate::parser::segment_number::basename(url);
    let lower = basename.to_ascii_lowercase();
    if lower.ends_with(".m3u8") {
        UrlKind::Manifest
    } else if lower.ends_with(".ts") {
        UrlKind::Segment
    } else if lower.ends_with(".mp4") && lower.contains("init") {
        UrlKind::Init
    } else {
        UrlKind::Unknown
    }
}

/// `Opening 'URL' for reading` -- a brand-new connection.
fn parse_url_open(line: &str) -> Option<&str> {
    let start = line.find("Opening '")? + "Opening '".len();
    let rest = &line[start..];
    let end = rest.find('\'')?;
    Some(&rest[..end])
}

/// `HTTP request for 'URL'` -- fires on keep-alive reuse, when no fresh
/// `Opening` line is emitted because the TCP connection is recycled.
fn parse_keepalive_reuse(line: &str) -> Option<&str> {
    let start = line.find("HTTP request for '")? + "HTTP request for '".len();
    let rest = &line[start..];
    let end = rest.find('\'')?;
    Some(&rest[..end])
}

/// `HTTP error 404 ...` -- extracts the leading 3-digit status code.
fn parse_http_error_code(line: &str) -> Option<u16> {
    let start = line.find("HTTP error ")? + "HTTP error ".len();
    let rest = &line[start..];
    let code_str: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    code_str.parse::<u16>().ok()
}

fn is_reconnect(line: &str) -> bool {
    line.contains("Reconnecting") || line.contains("reconnect")
}

fn is_timeout(line: &str) -> bool {
    line.contains("Connection timed out") || line.contains("timed out") || line.contains("Timeout")
}

pub struct DiagnosticStreamParser;

impl DiagnosticStreamParser {
    pub fn new() -> Self {
        Self
    }

    /// Process one diagnostic line against this client's stats. `cache`
    /// supplies segment sizes for throughput inference; tests can stub
    /// it without the HTTP scraper.
    pub fn feed_line(&self, line: &str, stats: &ClientStats, cache: &dyn SegmentSizeLookup) {
        if let Some(code) = parse_http_error_code(line) {
            stats.record_http_error(code);
        }
        if is_reconnect(line) {
            stats.record_reconnect();
        }
        if is_timeout(line) {
            stats.record_timeout();
        }

        let url = parse_url_open(line).or_else(|| parse_keepalive_reuse(line));
        let Some(url) = url else { return };

        match classify(url) {
            UrlKind::Manifest => {
                stats.record_manifest_request();
                let name = crate::parser::segment_number::basename(url).to_string();
                if let Some(wall_time) = stats.complete_oldest_manifest_if_different(&name) {
                    stats.manifest_latency.add(wall_time);
                }
                stats.open_manifest(name);
            }
            UrlKind::Segment => {
                stats.record_segment_request();
                let name = crate::parser::segment_number::basename(url).to_string();
                self.complete_segment_and_record_throughput(&name, stats, cache);
                stats.open_segment(name);
            }
            UrlKind::Init => {
                // Init segments are accounted as segment requests for
                // counting purposes but never feed latency/throughput --
                // there's exactly one per client lifetime, not a stream.
                stats.record_segment_request();
            }
            UrlKind::Unknown => {
                stats.record_unknown_request();
                debug!(url, "unclassified diagnostic URL open");
            }
        }
    }

    fn complete_segment_and_record_throughput(
        &self,
        name: &str,
        stats: &ClientStats,
        cache: &dyn SegmentSizeLookup,
    ) {
        let Some(wall_time) = stats.complete_oldest_segment_if_different(name) else {
            return;
        };
        stats.segment_latency.add(wall_time);
        if wall_time < MIN_WALL_TIME_FOR_THROUGHPUT {
            return;
        }
        if let Some(size) = cache.lookup(name) {
            let throughput = size as f64 / wall_time.as_secs_f64();
            stats.throughput.record(throughput);
        }
    }
}

impl Default for DiagnosticStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::client::DetectionThresholds;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    struct StubCache(HashMap<String, u64>);
    impl SegmentSizeLookup for StubCache {
        fn lookup(&self, name: &str) -> Option<u64> {
            self.0.get(name).copied()
        }
    }

    fn thresholds() -> DetectionThresholds {
        DetectionThresholds {
            stall_speed_threshold: 1.0,
            stall_sustained: StdDuration::from_secs(5),
            high_drift_threshold: StdDuration::from_secs(5),
        }
    }

    fn new_stats() -> ClientStats {
        ClientStats::new(0, thresholds(), 0.01, StdDuration::from_secs(30))
    }

    #[test]
    fn classifies_manifest_segment_and_unknown() {
        assert_eq!(classify("https://o/live/master.m3u8"), UrlKind::Manifest);
        assert_eq!(classify("https://o/live/seg1.ts"), UrlKind::Segment);
        assert_eq!(classify("https://o/live/init.mp4"), UrlKind::Init);
        assert_eq!(classify("https://o/live/readme.txt"), UrlKind::Unknown);
    }

    #[test]
    fn parses_http_error_code() {
        assert_eq!(parse_http_error_code("HTTP error 404 Not Found"), Some(404));
        assert_eq!(parse_http_error_code("no error here"), None);
    }

    #[test]
    fn segment_open_then_keepalive_reuse_both_recognized() {
        let parser = DiagnosticStreamParser::new();
        let stats = new_stats();
        let cache = StubCache(HashMap::new());
        parser.feed_line("Opening 'https://o/live/seg1.ts' for reading", &stats, &cache);
        parser.feed_line("HTTP request for 'https://o/live/seg2.ts'", &stats, &cache);
        assert_eq!(stats.segment_requests(), 2);
        assert_eq!(stats.pending_segment_count(), 1, "seg1 completed by seg2's open");
    }

    #[test]
    fn throughput_recorded_when_cache_hit_and_wall_time_sufficient() {
        let parser = DiagnosticStreamParser::new();
        let stats = new_stats();
        let mut sizes = HashMap::new();
        sizes.insert("seg1.ts".to_string(), 1_000_000u64);
        let cache = StubCache(sizes);

        parser.feed_line("Opening 'https://o/live/seg1.ts' for reading", &stats, &cache);
        std::thread::sleep(StdDuration::from_millis(5));
        parser.feed_line("Opening 'https://o/live/seg2.ts' for reading", &stats, &cache);

        let snapshot = stats.throughput.drain();
        assert_eq!(snapshot.count, 1);
    }

    #[test]
    fn reconnect_and_timeout_patterns_increment_counters() {
        let parser = DiagnosticStreamParser::new();
        let stats = new_stats();
        let cache = StubCache(HashMap::new());
        parser.feed_line("Reconnecting to origin after drop", &stats, &cache);
        parser.feed_line("Connection timed out while reading segment", &stats, &cache);
        assert_eq!(stats.reconnects(), 1);
        assert_eq!(stats.timeouts(), 1);
    }
}
