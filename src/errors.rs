//! Typed error taxonomy for failures that a caller must branch on.
//!
//! Parser malformed-input errors are deliberately *not* represented here:
//! per the parsing contract, a bad line is skipped and counted, never
//! surfaced as a `Result::Err`. Everything in this enum corresponds to a
//! row of the error taxonomy that callers act on (retry, backoff, log and
//! continue) rather than simply drop.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by core components, as opposed to `anyhow::Error` used
/// at the outer boundaries (config loading, main).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to spawn decoder process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("decoder process exited with code {code}")]
    ChildExit { code: i32 },

    #[error("decoder process terminated by signal")]
    ChildSignaled,

    #[error("parser pipeline drain timed out after {0:?}")]
    DrainTimeout(Duration),

    #[error("segment-size scrape failed: {0}")]
    ScrapeFailed(String),

    #[error("segment-size response exceeded {limit} bytes")]
    ScrapeResponseTooLarge { limit: u64 },

    #[error("first segment-size scrape did not complete within {0:?}")]
    FirstScrapeTimeout(Duration),

    #[error("decoder binary not found at {0}")]
    DecoderMissing(String),

    #[error("decoder version {found} is not in the supported set {supported:?}")]
    UnsupportedDecoderVersion {
        found: String,
        supported: Vec<String>,
    },

    #[error("origin unreachable: {0}")]
    OriginUnreachable(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("client {0} reached max_restarts_per_client and is now terminal")]
    ClientTerminal(usize),
}

pub type CoreResult<T> = Result<T, CoreError>;
