//! `ClientSupervisor`: owns at most one live decoder child at a time,
//! attaches its two parser pipelines, classifies exits, and restarts
//! with backoff up to `max_restarts_per_client`.
//!
//! The spawn-wait-classify-backoff shape is the async equivalent of
//! `hua0512-rust-srec`'s `process_runner::spawn_process_waiter`
//! (`tokio::select!` between a `CancellationToken` and the blocking
//! operation), looped and given a restart policy.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use rand::Rng;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RestartPolicyConfig};
use crate::decoder::DecoderInvocation;
use crate::errors::CoreError;
use crate::parser::diagnostic::DiagnosticStreamParser;
use crate::parser::pipeline;
use crate::parser::progress::ProgressStreamParser;
use crate::segment_cache::SegmentSizeLookup;
use crate::stats::client::ClientStats;
use crate::stats::rolling_rate::RollingRateTracker;

/// How long to wait after SIGTERM before escalating to SIGKILL.
const SIGTERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Spawning,
    Running,
    Draining,
    Exited,
    Backoff,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Clean,
    ExpectedShutdown,
    ExternalKill,
    Error,
}

/// 143 (128 + SIGTERM) is ambiguous on its own: it's exactly what this
/// supervisor's own graceful-shutdown signal produces, but an operator or
/// another process can send SIGTERM to a client for unrelated reasons
/// while the run is still live. Only treat it as an expected shutdown when
/// this supervisor is actually the one shutting down; otherwise restart
/// the client the same way an external SIGKILL (137) is restarted.
fn classify_exit(code: Option<i32>, shutting_down: bool) -> ExitClass {
    match code {
        Some(0) => ExitClass::Clean,
        Some(143) if shutting_down => ExitClass::ExpectedShutdown,
        Some(143) => ExitClass::ExternalKill,
        Some(137) => ExitClass::ExternalKill,
        None if shutting_down => ExitClass::ExpectedShutdown,
        _ => ExitClass::Error,
    }
}

/// `delay = min(max_backoff, initial_backoff * exponent^restarts) * (1 + U[-jitter, +jitter])`.
/// `jitter_sample` is a caller-supplied value in `[-1.0, 1.0]` so the formula
/// itself stays deterministic and testable; production callers pass a fresh
/// `U[-1,1]` draw each time.
fn backoff_delay(restart_count: u32, policy: &RestartPolicyConfig, jitter_sample: f64) -> Duration {
    let base = policy.initial_backoff.as_secs_f64() * policy.backoff_exponent.powi(restart_count as i32);
    let capped = base.min(policy.max_backoff.as_secs_f64());
    let jittered = capped * (1.0 + jitter_sample.clamp(-1.0, 1.0) * policy.jitter_fraction);
    Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(Duration::ZERO)
}

pub struct ClientSupervisor {
    client_id: usize,
    config: Arc<Config>,
    stats: Arc<ClientStats>,
    segment_cache: Arc<dyn SegmentSizeLookup>,
    rolling_rate: Arc<RollingRateTracker>,
    restart_count: AtomicU32,
    state: std::sync::Mutex<SupervisorState>,
}

impl ClientSupervisor {
    pub fn new(
        client_id: usize,
        config: Arc<Config>,
        stats: Arc<ClientStats>,
        segment_cache: Arc<dyn SegmentSizeLookup>,
        rolling_rate: Arc<RollingRateTracker>,
    ) -> Self {
        Self {
            client_id,
            config,
            stats,
            segment_cache,
            rolling_rate,
            restart_count: AtomicU32::new(0),
            state: std::sync::Mutex::new(SupervisorState::Idle),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, s: SupervisorState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn is_terminal(&self) -> bool {
        self.state() == SupervisorState::Terminal
    }

    /// Runs until `cancel` fires or the client enters `Terminal`.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                self.set_state(SupervisorState::Exited);
                break;
            }
            self.set_state(SupervisorState::Spawning);
            match self.spawn_and_run_one_child(cancel.clone()).await {
                Ok(exit_code) => {
                    self.set_state(SupervisorState::Exited);
                    let class = classify_exit(exit_code, cancel.is_cancelled());
                    info!(client_id = self.client_id, ?exit_code, ?class, "child exited");
                    self.record_exit_class(class);
                    match class {
                        ExitClass::Clean | ExitClass::ExternalKill if !cancel.is_cancelled() => {
                            self.restart_count.store(0, Ordering::Relaxed);
                            continue;
                        }
                        ExitClass::ExpectedShutdown => break,
                        ExitClass::Clean | ExitClass::ExternalKill => break,
                        ExitClass::Error => {
                            if !self.backoff_and_check_terminal(cancel.clone()).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(client_id = self.client_id, error = %e, "spawn failed");
                    if !self.backoff_and_check_terminal(cancel.clone()).await {
                        break;
                    }
                }
            }
        }
    }

    fn record_exit_class(&self, class: ExitClass) {
        match class {
            ExitClass::Clean => self.stats.record_exit_clean(),
            ExitClass::ExpectedShutdown => self.stats.record_exit_expected_shutdown(),
            ExitClass::ExternalKill => self.stats.record_exit_external_kill(),
            ExitClass::Error => self.stats.record_exit_error(),
        }
    }

    /// Returns `false` if the supervisor should stop (cancelled during
    /// backoff, or `max_restarts_per_client` reached).
    async fn backoff_and_check_terminal(&self, cancel: CancellationToken) -> bool {
        let restart_count = self.restart_count.fetch_add(1, Ordering::Relaxed) + 1;
        let policy = &self.config.file().restart_policy;
        if restart_count > policy.max_restarts_per_client {
            self.set_state(SupervisorState::Terminal);
            self.stats.mark_terminal();
            let err = CoreError::ClientTerminal(self.client_id);
            warn!(client_id = self.client_id, error = %err, "max_restarts_per_client reached, client is terminal");
            return false;
        }
        self.set_state(SupervisorState::Backoff);
        let jitter_sample = rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = backoff_delay(restart_count, policy, jitter_sample);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Sends SIGTERM to the child's process group (the child was spawned
    /// with `process_group(0)`, so signaling `-pid` reaches it and any
    /// reconnect subprocess it forked). The SIGKILL fallback after
    /// `SIGTERM_GRACE` still goes through `Child::start_kill`.
    fn send_sigterm(child: &tokio::process::Child) {
        let Some(pid) = child.id() else { return };
        if let Err(e) = signal::kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM delivery failed, falling back to SIGKILL at grace expiry");
        }
    }

    async fn spawn_and_run_one_child(
        &self,
        cancel: CancellationToken,
    ) -> crate::errors::CoreResult<Option<i32>> {
        let file = self.config.file();
        let invocation = DecoderInvocation::new(&file.decoder_invocation, file.origin.manifest_url.clone());
        let mut child = invocation.spawn()?;
        self.stats.on_process_start();
        self.set_state(SupervisorState::Running);

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let progress_health = self.stats.progress_health.clone();
        let diagnostic_health = self.stats.diagnostic_health.clone();
        let buffer_size = file.parser.stats_buffer_size;

        let stats_for_progress = self.stats.clone();
        let rolling_rate = self.rolling_rate.clone();
        let mut progress_parser = ProgressStreamParser::new();
        let progress_handle = pipeline::spawn(
            stdout,
            buffer_size,
            progress_health,
            cancel.clone(),
            move |line| {
                if let Some(update) = progress_parser.feed_line(&line) {
                    stats_for_progress.apply_progress_update(&update, &rolling_rate);
                }
            },
        );

        let stats_for_diagnostic = self.stats.clone();
        let segment_cache = self.segment_cache.clone();
        let diagnostic_parser = DiagnosticStreamParser::new();
        let diagnostic_handle = pipeline::spawn(
            stderr,
            buffer_size,
            diagnostic_health,
            cancel.clone(),
            move |line| {
                diagnostic_parser.feed_line(&line, &stats_for_diagnostic, segment_cache.as_ref());
            },
        );

        let exit_code = tokio::select! {
            _ = cancel.cancelled() => {
                Self::send_sigterm(&child);
                tokio::select! {
                    status = child.wait() => status.ok().and_then(|s| s.code()),
                    _ = tokio::time::sleep(SIGTERM_GRACE) => {
                        warn!(client_id = self.client_id, "child ignored SIGTERM, sending SIGKILL");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        None
                    }
                }
            }
            status = child.wait() => status.ok().and_then(|s| s.code()),
        };

        self.set_state(SupervisorState::Draining);
        let drain_timeout = file.parser.drain_timeout;
        if timeout(drain_timeout, async {
            let _ = progress_handle.await;
            let _ = diagnostic_handle.await;
        })
        .await
        .is_err()
        {
            warn!(client_id = self.client_id, "parser drain timed out, proceeding anyway");
        }

        self.stats.uptime.add(self.stats.process_uptime());
        debug!(client_id = self.client_id, ?exit_code, "client process interval complete");
        Ok(exit_code)
    }
}
