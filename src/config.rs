//! Configuration loading.
//!
//! Mirrors the teacher's two-layer split: a `#[derive(Deserialize)]` file
//! struct (`ConfigFile`) holding exactly what's on disk, wrapped by a
//! `Config` that also carries derived runtime resources (a shared
//! `reqwest::Client` pool) that don't belong in the serialized form.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn default_target_client_count() -> usize {
    10
}
fn default_ramp_rate() -> f64 {
    5.0
}
fn default_max_restarts() -> u32 {
    10
}
fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}
fn default_backoff_exponent() -> f64 {
    2.0
}
fn default_jitter_fraction() -> f64 {
    0.2
}
fn default_stats_buffer_size() -> usize {
    1000
}
fn default_drop_threshold() -> f64 {
    0.01
}
fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_scrape_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_scrape_jitter() -> Duration {
    Duration::from_secs(2)
}
fn default_window_size() -> usize {
    20
}
fn default_first_scrape_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_max_response_bytes() -> u64 {
    2 * 1024 * 1024
}
fn default_rolling_windows() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(30),
        Duration::from_secs(60),
        Duration::from_secs(300),
    ]
}
fn default_speed_threshold() -> f64 {
    1.0
}
fn default_sustained_duration() -> Duration {
    Duration::from_secs(5)
}
fn default_high_drift_threshold() -> Duration {
    Duration::from_secs(5)
}
fn default_network_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_user_agent() -> String {
    "hls-loadgen/0.1".to_string()
}
fn default_prometheus_listen_address() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_aggregation_cache_ttl() -> Duration {
    Duration::from_secs(1)
}
fn default_decoder_binary() -> String {
    "decoder".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts_per_client: u32,
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
    #[serde(default = "default_backoff_exponent")]
    pub backoff_exponent: f64,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for RestartPolicyConfig {
    fn default() -> Self {
        Self {
            max_restarts_per_client: default_max_restarts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_exponent: default_backoff_exponent(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default = "default_stats_buffer_size")]
    pub stats_buffer_size: usize,
    #[serde(default = "default_drop_threshold")]
    pub drop_threshold: f64,
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            stats_buffer_size: default_stats_buffer_size(),
            drop_threshold: default_drop_threshold(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCacheConfig {
    #[serde(with = "humantime_serde", default = "default_scrape_interval")]
    pub scrape_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_scrape_jitter")]
    pub jitter: Duration,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(with = "humantime_serde", default = "default_first_scrape_timeout")]
    pub first_scrape_timeout: Duration,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,
}

impl Default for SegmentCacheConfig {
    fn default() -> Self {
        Self {
            scrape_interval: default_scrape_interval(),
            jitter: default_scrape_jitter(),
            window_size: default_window_size(),
            first_scrape_timeout: default_first_scrape_timeout(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallDetectionConfig {
    #[serde(default = "default_speed_threshold")]
    pub speed_threshold: f64,
    #[serde(with = "humantime_serde", default = "default_sustained_duration")]
    pub sustained_duration: Duration,
}

impl Default for StallDetectionConfig {
    fn default() -> Self {
        Self {
            speed_threshold: default_speed_threshold(),
            sustained_duration: default_sustained_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftDetectionConfig {
    #[serde(with = "humantime_serde", default = "default_high_drift_threshold")]
    pub high_drift_threshold: Duration,
}

impl Default for DriftDetectionConfig {
    fn default() -> Self {
        Self {
            high_drift_threshold: default_high_drift_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OriginConfig {
    pub manifest_url: String,
    pub segment_size_endpoint: Option<String>,
    pub pin_to_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderInvocationConfig {
    #[serde(default = "default_decoder_binary")]
    pub binary_path: String,
    #[serde(default)]
    pub supported_versions: Vec<String>,
    #[serde(default)]
    pub logging_verbosity: String,
    #[serde(default)]
    pub reconnect_policy: Vec<String>,
    #[serde(with = "humantime_serde", default = "default_network_timeout")]
    pub network_timeout: Duration,
    #[serde(default)]
    pub variant_selection_policy: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

impl Default for DecoderInvocationConfig {
    fn default() -> Self {
        Self {
            binary_path: default_decoder_binary(),
            supported_versions: Vec::new(),
            logging_verbosity: "info".to_string(),
            reconnect_policy: Vec::new(),
            network_timeout: default_network_timeout(),
            variant_selection_policy: None,
            user_agent: default_user_agent(),
            extra_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub tui_enabled: bool,
    #[serde(default = "default_prometheus_listen_address")]
    pub prometheus_listen_address: String,
    #[serde(default)]
    pub per_client_metrics: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            tui_enabled: default_true(),
            prometheus_listen_address: default_prometheus_listen_address(),
            per_client_metrics: false,
        }
    }
}

/// Parsed configuration file (deserializable), as it appears on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_target_client_count")]
    pub target_client_count: usize,
    #[serde(default = "default_ramp_rate")]
    pub ramp_rate: f64,
    #[serde(with = "humantime_serde", default)]
    pub run_duration: Option<Duration>,

    #[serde(default)]
    pub restart_policy: RestartPolicyConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub segment_cache: SegmentCacheConfig,
    #[serde(default = "default_rolling_windows")]
    pub rolling_windows: Vec<Duration>,
    #[serde(default)]
    pub stall_detection: StallDetectionConfig,
    #[serde(default)]
    pub drift_detection: DriftDetectionConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub decoder_invocation: DecoderInvocationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(with = "humantime_serde", default = "default_aggregation_cache_ttl")]
    pub aggregation_cache_ttl: Duration,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            target_client_count: default_target_client_count(),
            ramp_rate: default_ramp_rate(),
            run_duration: None,
            restart_policy: RestartPolicyConfig::default(),
            parser: ParserConfig::default(),
            segment_cache: SegmentCacheConfig::default(),
            rolling_windows: default_rolling_windows(),
            stall_detection: StallDetectionConfig::default(),
            drift_detection: DriftDetectionConfig::default(),
            origin: OriginConfig::default(),
            decoder_invocation: DecoderInvocationConfig::default(),
            metrics: MetricsConfig::default(),
            aggregation_cache_ttl: default_aggregation_cache_ttl(),
        }
    }
}

/// Runtime configuration shared across all components.
///
/// Wraps the parsed file plus a shared `reqwest::Client` connection pool,
/// the way the teacher's `Config` wraps `ConfigFile` plus its HTTP client.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigFile>,
    http_client: reqwest::Client,
}

fn hostname_and_port_of(url: &str) -> Option<(String, u16)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(443);
    Some((host, port))
}

/// Loads and parses a `ConfigFile` without wrapping it in a `Config`,
/// so callers (the CLI) can apply overrides before the runtime HTTP
/// client gets built and validation runs.
pub fn load_file(path: &str) -> Result<ConfigFile> {
    let expanded = shellexpand::tilde(path).to_string();
    let text = std::fs::read_to_string(&expanded)
        .with_context(|| format!("reading config file {expanded}"))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {expanded}"))
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let file = load_file(path)?;
        Self::from_file_struct(file)
    }

    pub fn from_file_struct(file: ConfigFile) -> Result<Self> {
        file.validate()?;
        let mut builder = reqwest::Client::builder().timeout(file.decoder_invocation.network_timeout);
        if let Some(pinned) = file.origin.pin_to_ip {
            // Pins every HTTP request this process makes (origin reachability
            // preflight, segment-size scrapes) to one resolved address,
            // bypassing DNS -- useful for load-testing a single origin pod
            // behind a round-robin name.
            if let Some((host, port)) = hostname_and_port_of(&file.origin.manifest_url) {
                builder = builder.resolve(&host, std::net::SocketAddr::new(pinned, port));
            }
        }
        let http_client = builder.build().context("building shared HTTP client")?;
        Ok(Self {
            inner: Arc::new(file),
            http_client,
        })
    }

    pub fn file(&self) -> &ConfigFile {
        &self.inner
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }
}

impl ConfigFile {
    fn validate(&self) -> Result<()> {
        if self.target_client_count == 0 {
            anyhow::bail!("target_client_count must be > 0");
        }
        if self.ramp_rate <= 0.0 {
            anyhow::bail!("ramp_rate must be > 0");
        }
        if self.origin.manifest_url.is_empty() {
            anyhow::bail!("origin.manifest_url must be set");
        }
        if self.restart_policy.backoff_exponent <= 1.0 {
            anyhow::bail!("restart_policy.backoff_exponent must be > 1.0");
        }
        if self.segment_cache.window_size == 0 {
            anyhow::bail!("segment_cache.window_size must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let toml_src = r#"
            [origin]
            manifest_url = "https://example.test/master.m3u8"
        "#;
        let file: ConfigFile = toml::from_str(toml_src).unwrap();
        assert_eq!(file.target_client_count, default_target_client_count());
        assert_eq!(file.rolling_windows.len(), 4);
        file.validate().unwrap();
    }

    #[test]
    fn rejects_zero_clients() {
        let mut file = ConfigFile {
            origin: OriginConfig {
                manifest_url: "https://example.test/master.m3u8".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        file.target_client_count = 0;
        assert!(file.validate().is_err());
    }

    #[test]
    fn zero_stats_buffer_size_is_accepted_at_config_layer() {
        // An explicit 0 is a valid (if degenerate) user choice; the pipeline
        // itself clamps to a sane minimum at construction time (see
        // parser::pipeline), config validation does not reject it.
        let cfg = ParserConfig {
            stats_buffer_size: 0,
            ..ParserConfig::default()
        };
        assert_eq!(cfg.stats_buffer_size, 0);
    }
}
