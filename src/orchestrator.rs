//! `Orchestrator`: wires every component together in spec.md §4.8's
//! strict startup order, ramps clients up at a configured rate, and
//! coordinates shutdown (signal or `run_duration` expiry) down to a
//! final summary print.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::StatsAggregator;
use crate::config::Config;
use crate::dashboard;
use crate::errors::CoreResult;
use crate::metrics::MetricsRegistry;
use crate::segment_cache::SegmentSizeCache;
use crate::stats::client::{ClientStats, DetectionThresholds};
use crate::stats::rolling_rate::RollingRateTracker;
use crate::summary;
use crate::supervisor::ClientSupervisor;

/// Overall deadline for all supervisors to finish draining once shutdown
/// begins, on top of each supervisor's own `drain_timeout`.
const SHUTDOWN_OVERALL_DEADLINE: Duration = Duration::from_secs(30);

pub struct Orchestrator {
    config: Arc<Config>,
    metrics: Arc<MetricsRegistry>,
}

impl Orchestrator {
    pub fn new(config: Config, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            metrics,
        }
    }

    pub async fn run(self) -> CoreResult<()> {
        let file = self.config.file().clone();
        let root_cancel = CancellationToken::new();

        let rolling_rate = Arc::new(RollingRateTracker::new(rolling_rate_capacity(&file.rolling_windows)));

        let segment_cache_endpoint = file
            .origin
            .segment_size_endpoint
            .clone()
            .unwrap_or_else(|| file.origin.manifest_url.clone());
        let segment_cache = SegmentSizeCache::new(
            file.segment_cache.clone(),
            segment_cache_endpoint,
            self.config.http_client().clone(),
        );

        info!("starting segment size cache, awaiting first scrape");
        match tokio::time::timeout(file.segment_cache.first_scrape_timeout, segment_cache.scrape_once()).await {
            Ok(Ok(count)) => info!(count, "first segment size scrape complete"),
            Ok(Err(e)) => warn!(error = %e, "first segment size scrape failed, continuing with a cold cache"),
            Err(_) => warn!("first segment size scrape timed out, continuing with a cold cache"),
        }
        let cache_task = tokio::spawn(segment_cache.clone().run(root_cancel.clone()));

        let aggregator = Arc::new(StatsAggregator::new(
            rolling_rate.clone(),
            file.rolling_windows.clone(),
            file.aggregation_cache_ttl,
            file.target_client_count,
        ));
        let aggregator_task = spawn_aggregator_refresh_loop(aggregator.clone(), file.aggregation_cache_ttl, root_cancel.clone());

        let thresholds = DetectionThresholds::from_config(&file.stall_detection, &file.drift_detection);
        let mut supervisor_tasks: Vec<JoinHandle<()>> = Vec::new();
        let ramp_task = {
            let config = self.config.clone();
            let aggregator = aggregator.clone();
            let segment_cache = segment_cache.clone();
            let rolling_rate = rolling_rate.clone();
            let cancel = root_cancel.clone();
            let target = file.target_client_count;
            let ramp_rate = file.ramp_rate;
            let latency_window = *file.rolling_windows.iter().max().unwrap_or(&Duration::from_secs(60));
            let drop_threshold = file.parser.drop_threshold;
            tokio::spawn(async move {
                let mut tasks = Vec::new();
                let spawn_interval = Duration::try_from_secs_f64(1.0 / ramp_rate).unwrap_or(Duration::ZERO);
                for client_id in 0..target {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let stats = Arc::new(ClientStats::new(client_id, thresholds, drop_threshold, latency_window));
                    aggregator.register_client(stats.clone());
                    let supervisor = Arc::new(ClientSupervisor::new(
                        client_id,
                        config.clone(),
                        stats,
                        segment_cache.clone(),
                        rolling_rate.clone(),
                    ));
                    let supervisor_cancel = cancel.clone();
                    tasks.push(tokio::spawn(async move {
                        supervisor.run(supervisor_cancel).await;
                    }));
                    if client_id + 1 < target && !spawn_interval.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(spawn_interval) => {}
                        }
                    }
                }
                info!(spawned = tasks.len(), target, "ramp-up complete");
                tasks
            })
        };

        let dashboard_task = if file.metrics.tui_enabled {
            Some(tokio::spawn(dashboard::run(aggregator.clone(), root_cancel.clone())))
        } else {
            None
        };
        let metrics_server_task = tokio::spawn(crate::metrics::serve(
            self.metrics.clone(),
            aggregator.clone(),
            file.metrics.prometheus_listen_address.clone(),
            root_cancel.clone(),
        ));

        wait_for_shutdown_signal(&file.run_duration, &root_cancel).await;
        info!("shutdown initiated, cancelling all tasks");

        if let Ok(tasks) = ramp_task.await {
            supervisor_tasks = tasks;
        }
        let drain = tokio::time::timeout(SHUTDOWN_OVERALL_DEADLINE, async {
            for task in supervisor_tasks {
                let _ = task.await;
            }
        })
        .await;
        if drain.is_err() {
            warn!("not all supervisors finished draining within the overall shutdown deadline");
        }

        let _ = cache_task.await;
        let _ = aggregator_task.await;
        if let Some(task) = dashboard_task {
            let _ = task.await;
        }
        metrics_server_task.abort();

        let final_stats = aggregator.get_aggregate_stats();
        summary::print(&final_stats);

        Ok(())
    }
}

fn rolling_rate_capacity(windows: &[Duration]) -> usize {
    // Generous relative to the longest window at a plausible sample rate
    // (roughly one feed per progress block, several per second per client).
    let longest = windows.iter().max().copied().unwrap_or(Duration::from_secs(300));
    (longest.as_secs() as usize * 20).clamp(256, 1 << 16)
}

fn spawn_aggregator_refresh_loop(
    aggregator: Arc<StatsAggregator>,
    ttl: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ttl.max(Duration::from_millis(50)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = aggregator.get_aggregate_stats();
                }
            }
        }
    })
}

async fn wait_for_shutdown_signal(run_duration: &Option<Duration>, cancel: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    match run_duration {
        Some(duration) => {
            tokio::select! {
                _ = ctrl_c => info!("received interrupt signal"),
                _ = tokio::time::sleep(*duration) => info!(?duration, "run_duration elapsed"),
            }
        }
        None => {
            let _ = ctrl_c.await;
            info!("received interrupt signal");
        }
    }
    cancel.cancel();
}
