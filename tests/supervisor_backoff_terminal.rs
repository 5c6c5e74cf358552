//! Drives `ClientSupervisor` against a real child process (`/bin/false`,
//! present on any POSIX test runner) that always exits non-zero, exercising
//! the restart/backoff loop through to the terminal state described in
//! spec.md §8's restart-policy scenario.

use std::sync::Arc;
use std::time::Duration;

use hls_loadgen::config::{Config, ConfigFile, DecoderInvocationConfig, OriginConfig, RestartPolicyConfig};
use hls_loadgen::segment_cache::SegmentSizeLookup;
use hls_loadgen::stats::rolling_rate::RollingRateTracker;
use hls_loadgen::stats::{ClientStats, DetectionThresholds};
use hls_loadgen::supervisor::{ClientSupervisor, SupervisorState};
use tokio_util::sync::CancellationToken;

struct EmptyCache;
impl SegmentSizeLookup for EmptyCache {
    fn lookup(&self, _name: &str) -> Option<u64> {
        None
    }
}

fn config_always_failing_binary() -> Config {
    let file = ConfigFile {
        origin: OriginConfig {
            manifest_url: "https://origin.test/master.m3u8".to_string(),
            ..Default::default()
        },
        decoder_invocation: DecoderInvocationConfig {
            binary_path: "/bin/false".to_string(),
            ..Default::default()
        },
        restart_policy: RestartPolicyConfig {
            max_restarts_per_client: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_exponent: 2.0,
            jitter_fraction: 0.0,
        },
        ..Default::default()
    };
    Config::from_file_struct(file).expect("valid config")
}

#[tokio::test]
async fn always_failing_decoder_reaches_terminal_after_max_restarts() {
    let config = Arc::new(config_always_failing_binary());
    let thresholds = DetectionThresholds::from_config(
        &config.file().stall_detection,
        &config.file().drift_detection,
    );
    let stats = Arc::new(ClientStats::new(
        0,
        thresholds,
        config.file().parser.drop_threshold,
        Duration::from_secs(30),
    ));
    let cache: Arc<dyn SegmentSizeLookup> = Arc::new(EmptyCache);
    let rolling_rate = Arc::new(RollingRateTracker::new(64));

    let supervisor = ClientSupervisor::new(0, config, stats, cache, rolling_rate);
    let cancel = CancellationToken::new();

    tokio::time::timeout(Duration::from_secs(5), supervisor.run(cancel.clone()))
        .await
        .expect("supervisor should reach a terminal state well before the timeout");

    assert!(supervisor.is_terminal());
    assert_eq!(supervisor.state(), SupervisorState::Terminal);
}
