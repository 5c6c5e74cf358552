//! Three-layer lossy pipeline: reader -> bounded channel -> parser, one
//! instance per (child, stream). The reader must never block on a slow
//! parser -- a blocked reader stalls the child's write, which stalls its
//! network download, which distorts the measurement this whole crate
//! exists to take.
//!
//! Grounded in `hua0512-rust-srec`'s `process_runner::spawn_process_waiter`
//! for the cancellation-aware task-spawning shape (`tokio::select!` between
//! cancellation and the blocking operation), generalized from "wait for a
//! child" to "read lines from a child's pipe."

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stats::atomic_f64::AtomicF64;

/// Read/parse/drop counters for one stream of one client, shared between
/// the reader task, the parser task, and whatever reads it back for the
/// degraded-client computation and the `/metrics` pipeline-health gauges.
pub struct PipelineHealth {
    lines_read: AtomicU64,
    lines_parsed: AtomicU64,
    lines_dropped: AtomicU64,
    peak_drop_rate: AtomicF64,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            lines_read: AtomicU64::new(0),
            lines_parsed: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
            peak_drop_rate: AtomicF64::new(0.0),
        }
    }

    fn record_read(&self) {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parsed(&self) {
        self.lines_parsed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.lines_dropped.fetch_add(1, Ordering::Relaxed);
        self.peak_drop_rate.fetch_max(self.drop_rate());
    }

    pub fn drop_rate(&self) -> f64 {
        let read = self.lines_read.load(Ordering::Relaxed) as f64;
        if read == 0.0 {
            0.0
        } else {
            self.lines_dropped.load(Ordering::Relaxed) as f64 / read
        }
    }

    pub fn peak_drop_rate(&self) -> f64 {
        self.peak_drop_rate.load()
    }

    pub fn lines_read(&self) -> u64 {
        self.lines_read.load(Ordering::Relaxed)
    }
    pub fn lines_parsed(&self) -> u64 {
        self.lines_parsed.load(Ordering::Relaxed)
    }
    pub fn lines_dropped(&self) -> u64 {
        self.lines_dropped.load(Ordering::Relaxed)
    }
}

const DEFAULT_STATS_BUFFER_SIZE: usize = 1000;

/// Spawns the reader and parser tasks for one (child, stream) pair and
/// returns immediately; both tasks run until the pipe hits EOF or the
/// cancellation token fires.
///
/// `stats_buffer_size == 0` falls back to the documented default rather
/// than constructing a channel of capacity zero (which would drop every
/// line).
pub fn spawn<R, F>(
    reader: R,
    stats_buffer_size: usize,
    health: Arc<PipelineHealth>,
    cancel: CancellationToken,
    mut handle_line: F,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    let capacity = if stats_buffer_size == 0 {
        DEFAULT_STATS_BUFFER_SIZE
    } else {
        stats_buffer_size
    };
    let (tx, mut rx) = mpsc::channel::<String>(capacity);

    let reader_health = health.clone();
    let reader_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let next = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                line = lines.next_line() => line,
            };
            match next {
                Ok(Some(line)) => {
                    reader_health.record_read();
                    if tx.try_send(line).is_err() {
                        reader_health.record_dropped();
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "pipe read error, ending reader");
                    break;
                }
            }
        }
        // tx drops here, closing the channel and unblocking the parser task.
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            handle_line(line);
            health.record_parsed();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn lines_parsed_plus_dropped_equals_lines_read_under_backpressure() {
        let input = (0..500).map(|i| format!("line{i}\n")).collect::<String>();
        let health = Arc::new(PipelineHealth::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let cancel = CancellationToken::new();

        spawn(
            input.as_bytes(),
            4, // tiny capacity to force drops under a slow consumer
            health.clone(),
            cancel.clone(),
            move |line| {
                seen_clone.lock().unwrap().push(line);
            },
        );

        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            health.lines_parsed() + health.lines_dropped(),
            health.lines_read()
        );
    }

    #[test]
    fn drop_rate_is_zero_with_no_reads() {
        let health = PipelineHealth::new();
        assert_eq!(health.drop_rate(), 0.0);
    }

    #[test]
    fn peak_drop_rate_is_monotone() {
        let health = PipelineHealth::new();
        health.record_read();
        health.record_dropped();
        let first_peak = health.peak_drop_rate();
        for _ in 0..10 {
            health.record_read();
        }
        health.record_dropped();
        assert!(health.peak_drop_rate() >= first_peak);
    }
}
