use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hls_loadgen::config::{self, Config};
use hls_loadgen::metrics::MetricsRegistry;
use hls_loadgen::orchestrator::Orchestrator;
use hls_loadgen::preflight;

#[derive(Parser)]
#[command(name = "hls-loadgen")]
#[command(about = "Load generator and observability harness for HLS origins", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "HLS_LOADGEN_CONFIG", default_value = "~/.hls-loadgen/config.toml")]
    config: String,

    /// Overrides `target_client_count` from the config file
    #[arg(long, env = "HLS_LOADGEN_CLIENT_COUNT")]
    client_count: Option<usize>,

    /// Overrides `ramp_rate` (clients spawned per second) from the config file
    #[arg(long, env = "HLS_LOADGEN_RAMP_RATE")]
    ramp_rate: Option<f64>,

    /// Overrides `run_duration` (e.g. "5m", "1h") from the config file; unset runs until Ctrl-C
    #[arg(long, env = "HLS_LOADGEN_RUN_DURATION")]
    run_duration: Option<String>,

    /// Overrides the host the Prometheus `/metrics` endpoint binds to
    #[arg(long, env = "HLS_LOADGEN_HOST")]
    host: Option<String>,

    /// Overrides the port the Prometheus `/metrics` endpoint binds to
    #[arg(long, env = "HLS_LOADGEN_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hls_loadgen=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let mut file = config::load_file(&config_path)
        .with_context(|| format!("loading config file {config_path}"))?;
    if let Some(count) = cli.client_count {
        file.target_client_count = count;
    }
    if let Some(rate) = cli.ramp_rate {
        file.ramp_rate = rate;
    }
    if let Some(duration) = &cli.run_duration {
        file.run_duration = Some(
            humantime::parse_duration(duration)
                .with_context(|| format!("parsing --run-duration {duration}"))?,
        );
    }
    if cli.host.is_some() || cli.port.is_some() {
        let (default_host, default_port) = file
            .metrics
            .prometheus_listen_address
            .rsplit_once(':')
            .map(|(h, p)| (h.to_string(), p.to_string()))
            .context("config metrics.prometheus_listen_address must be host:port")?;
        let host = cli.host.unwrap_or(default_host);
        let port = cli.port.map(|p| p.to_string()).unwrap_or(default_port);
        file.metrics.prometheus_listen_address = format!("{host}:{port}");
    }
    let config = Config::from_file_struct(file)?;
    tracing::info!(path = %config_path, "loaded configuration");
    tracing::info!(
        target_client_count = config.file().target_client_count,
        ramp_rate = config.file().ramp_rate,
        manifest_url = %config.file().origin.manifest_url,
        "starting run"
    );

    preflight::run(&config).await?;

    let metrics = Arc::new(MetricsRegistry::new());
    Orchestrator::new(config, metrics).run().await?;

    Ok(())
}
