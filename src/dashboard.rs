//! Live TUI: a `ratatui` terminal UI updated at roughly 4 Hz, reading
//! `AggregateStats` directly off the shared aggregator rather than over
//! HTTP -- the one genuine architecture change from the teacher's
//! dashboard, which polled its own REST API from a background thread
//! because it ran in a different process. Everything downstream of that
//! (alternate-screen setup/teardown, a fixed tick-rate poll loop, `q`/Esc
//! to quit) keeps the teacher's shape.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Terminal,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::{AggregateStats, StatsAggregator};

const TICK_RATE: Duration = Duration::from_millis(250);
const LOG_FALLBACK_INTERVAL: Duration = Duration::from_secs(5);

/// Entry point the orchestrator spawns as its own task. Runs until
/// `cancel` fires. When stdout isn't a TTY (piped output, CI), falls
/// back to periodic `info!` lines instead of failing to start a TUI that
/// can't render anywhere.
pub async fn run(aggregator: Arc<StatsAggregator>, cancel: CancellationToken) {
    if !io::stdout().is_terminal() {
        info!("stdout is not a terminal, falling back to periodic text summaries");
        run_log_fallback(aggregator, cancel).await;
        return;
    }

    let result =
        tokio::task::spawn_blocking(move || run_blocking(aggregator, cancel)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "dashboard exited with an error"),
        Err(e) => warn!(error = %e, "dashboard task panicked"),
    }
}

async fn run_log_fallback(aggregator: Arc<StatsAggregator>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(LOG_FALLBACK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = aggregator.get_aggregate_stats();
                info!(
                    active = stats.active_clients,
                    target = stats.target_clients,
                    stalled = stats.stalled_clients,
                    degraded = stats.degraded_clients,
                    bytes_total = stats.total_bytes,
                    avg_speed = stats.average_speed,
                    "fleet status"
                );
            }
        }
    }
}

fn run_blocking(aggregator: Arc<StatsAggregator>, cancel: CancellationToken) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_loop(&mut terminal, aggregator, cancel);

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    res
}

fn run_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    aggregator: Arc<StatsAggregator>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let started_at = Instant::now();
    let mut last_tick = Instant::now();
    let mut stats = aggregator.get_aggregate_stats();

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if last_tick.elapsed() >= TICK_RATE {
            stats = aggregator.get_aggregate_stats();
            last_tick = Instant::now();
        }

        terminal.draw(|f| ui(f, &stats, started_at))?;

        let poll_timeout = TICK_RATE
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);
        if event::poll(poll_timeout)? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    return Ok(());
                }
            }
        }
    }
}

fn ui(f: &mut ratatui::Frame, stats: &AggregateStats, started_at: Instant) {
    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Percentage(45),
            Constraint::Min(0),
        ])
        .split(f.area());

    render_header(f, main_chunks[0], stats, started_at);
    render_request_table(f, main_chunks[1], stats);
    render_latency_table(f, main_chunks[2], stats);
}

fn render_header(f: &mut ratatui::Frame, area: Rect, stats: &AggregateStats, started_at: Instant) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(34),
            Constraint::Percentage(33),
            Constraint::Percentage(33),
        ])
        .split(area);

    let clients_style = if stats.stalled_clients > 0 || stats.degraded_clients > 0 {
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
    };
    let clients_text = format!("{}/{} clients", stats.active_clients, stats.target_clients);
    f.render_widget(
        Paragraph::new(Line::from(vec![Span::styled(clients_text, clients_style)]))
            .block(Block::default().borders(Borders::ALL).title("Ramp")),
        chunks[0],
    );

    let health_text = format!(
        "{} stalled / {} degraded / {} high-drift",
        stats.stalled_clients, stats.degraded_clients, stats.high_drift_clients
    );
    f.render_widget(
        Paragraph::new(health_text).block(Block::default().borders(Borders::ALL).title("Health")),
        chunks[1],
    );

    let git_branch = option_env!("GIT_BRANCH").unwrap_or("unknown");
    let elapsed_text = format!(
        "{:.0}s elapsed, {:.2}x avg speed ({})",
        started_at.elapsed().as_secs_f64(),
        stats.average_speed,
        git_branch
    );
    f.render_widget(
        Paragraph::new(elapsed_text).block(Block::default().borders(Borders::ALL).title("Run")),
        chunks[2],
    );
}

fn render_request_table(f: &mut ratatui::Frame, area: Rect, stats: &AggregateStats) {
    let rows = vec![Row::new(vec![
        Cell::from(stats.manifest_requests.to_string()),
        Cell::from(stats.segment_requests.to_string()),
        Cell::from(stats.unknown_requests.to_string()),
        Cell::from(format_bytes(stats.total_bytes)),
        Cell::from(stats.reconnects.to_string()),
        Cell::from(stats.timeouts.to_string()),
        Cell::from(stats.stalls.to_string()),
    ])];
    let table = Table::new(
        rows,
        [
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(12),
            Constraint::Length(12),
            Constraint::Length(10),
            Constraint::Length(8),
        ],
    )
    .header(
        Row::new(vec![
            "Manifests", "Segments", "Unknown", "Bytes", "Reconnects", "Timeouts", "Stalls",
        ])
        .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title("Requests"));
    f.render_widget(table, area);
}

fn render_latency_table(f: &mut ratatui::Frame, area: Rect, stats: &AggregateStats) {
    let row = |label: &str, p50: Option<Duration>, p95: Option<Duration>, p99: Option<Duration>| {
        Row::new(vec![
            Cell::from(label.to_string()),
            Cell::from(format_opt_ms(p50)),
            Cell::from(format_opt_ms(p95)),
            Cell::from(format_opt_ms(p99)),
        ])
    };
    let rows = vec![
        row(
            "manifest (inferred)",
            stats.manifest_latency_p50,
            stats.manifest_latency_p95,
            stats.manifest_latency_p99,
        ),
        row(
            "segment (inferred)",
            stats.segment_latency_p50,
            stats.segment_latency_p95,
            stats.segment_latency_p99,
        ),
    ];
    let table = Table::new(
        rows,
        [
            Constraint::Length(19),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(10),
        ],
    )
    .header(Row::new(vec!["", "p50", "p95", "p99"]).style(Style::default().add_modifier(Modifier::BOLD)))
    .block(
        Block::default().borders(Borders::ALL).title(format!(
            "Inferred Latency (throughput p50 {:.0} B/s, max {:.0} B/s)",
            stats.throughput_p50, stats.throughput_max
        )),
    );
    f.render_widget(table, area);
}

fn format_opt_ms(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:.1}ms", d.as_secs_f64() * 1000.0),
        None => "-".to_string(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1}{}", UNITS[unit])
}
