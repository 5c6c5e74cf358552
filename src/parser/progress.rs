//! Parses the decoder's structured `key=value` progress stream into
//! `ProgressUpdate` events.
//!
//! Blocks are terminated by a `progress=continue` or `progress=end` line;
//! only `total_size`, `out_time_us`, `speed`, `bitrate`, and `progress`
//! are meaningful. Everything else is ignored, and an unparseable value
//! for a meaningful key degrades that one field to its default rather
//! than dropping the whole block -- parser malformed input is "skip and
//! continue," never a pipeline failure.

/// One completed progress block.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Cumulative bytes reported by the decoder for the current child
    /// process only; resets to 0 on every spawn.
    pub total_size: u64,
    pub out_time_us: i64,
    pub speed: f64,
    pub bitrate: String,
    /// `true` when this block ended with `progress=end`.
    pub ended: bool,
}

impl Default for ProgressUpdate {
    fn default() -> Self {
        Self {
            total_size: 0,
            out_time_us: 0,
            speed: 0.0,
            bitrate: String::new(),
            ended: false,
        }
    }
}

/// Parses `speed=1.00x` style values, stripping a trailing `x`/`X`.
/// `N/A` (and any other unparseable value) parses to `0.0`, never `NaN`.
fn parse_speed(raw: &str) -> f64 {
    raw.trim()
        .trim_end_matches(['x', 'X'])
        .parse::<f64>()
        .unwrap_or(0.0)
}

#[derive(Debug, Default)]
pub struct ProgressStreamParser {
    block: ProgressUpdate,
}

impl ProgressStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns `Some(update)` exactly when the line
    /// completes a block (a `progress=` line).
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            return None;
        };
        match key {
            "total_size" => {
                self.block.total_size = value.trim().parse().unwrap_or(self.block.total_size);
            }
            "out_time_us" => {
                self.block.out_time_us = value.trim().parse().unwrap_or(self.block.out_time_us);
            }
            "speed" => {
                self.block.speed = parse_speed(value);
            }
            "bitrate" => {
                self.block.bitrate = value.trim().to_string();
            }
            "progress" => {
                let ended = value.trim() == "end";
                let mut completed = std::mem::take(&mut self.block);
                completed.ended = ended;
                return Some(completed);
            }
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(lines: &[&str]) -> ProgressUpdate {
        let mut parser = ProgressStreamParser::new();
        let mut last = None;
        for line in lines {
            last = parser.feed_line(line);
        }
        last.expect("block should have completed")
    }

    #[test]
    fn parses_a_complete_continue_block() {
        let update = block(&[
            "total_size=1048576",
            "out_time_us=2000000",
            "speed=1.00x",
            "bitrate=5000kbits/s",
            "progress=continue",
        ]);
        assert_eq!(update.total_size, 1_048_576);
        assert_eq!(update.out_time_us, 2_000_000);
        assert_eq!(update.speed, 1.0);
        assert_eq!(update.bitrate, "5000kbits/s");
        assert!(!update.ended);
    }

    #[test]
    fn progress_end_marks_block_ended() {
        let update = block(&["total_size=10", "progress=end"]);
        assert!(update.ended);
    }

    #[test]
    fn speed_na_parses_to_zero_not_nan() {
        let update = block(&["speed=N/A", "progress=continue"]);
        assert_eq!(update.speed, 0.0);
    }

    #[test]
    fn unparseable_numeric_value_does_not_panic_and_keeps_default() {
        let update = block(&["total_size=not-a-number", "progress=continue"]);
        assert_eq!(update.total_size, 0);
    }

    #[test]
    fn lines_with_no_equals_sign_are_ignored() {
        let mut parser = ProgressStreamParser::new();
        assert_eq!(parser.feed_line("frame=120"), None);
        assert_eq!(parser.feed_line("not a kv line at all"), None);
    }

    #[test]
    fn state_resets_between_blocks() {
        let mut parser = ProgressStreamParser::new();
        parser.feed_line("total_size=999");
        parser.feed_line("progress=continue");
        let second = parser.feed_line("progress=continue").unwrap();
        assert_eq!(second.total_size, 0, "fields must not leak across blocks");
    }
}
