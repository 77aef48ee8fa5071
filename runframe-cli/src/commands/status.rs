//! `runframe status` — sync and render state of the running daemon.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use runframe_daemon::request_status;

/// Arguments for `runframe status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let Some(payload) = super::or_not_running(request_status(&home), "query daemon status")?
        else {
            return Ok(());
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        let status: DaemonStatus =
            serde_json::from_value(payload).context("unexpected daemon status payload")?;
        print_status(status);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DaemonStatus {
    started_at: DateTime<Utc>,
    server_url: String,
    entrypoint: Option<String>,
    manual_run: bool,
    engine_version: Option<String>,
    pending_edits: usize,
    sync: SyncView,
    render: RenderView,
}

#[derive(Debug, Deserialize)]
struct SyncView {
    phase: String,
    polling: bool,
    last_event_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    file_count: usize,
    rounds: u64,
    failed_rounds: u64,
}

#[derive(Debug, Deserialize)]
struct RenderView {
    state: String,
    progress: f64,
    last_run: Option<u64>,
    last_error: Option<FailureView>,
    last_artifact_elements: Option<usize>,
    #[serde(default)]
    phase_timings: Vec<TimingView>,
}

#[derive(Debug, Deserialize)]
struct FailureView {
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize, Tabled)]
struct TimingView {
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "ms")]
    millis: u64,
}

fn print_status(status: DaemonStatus) {
    println!(
        "runframe v{} | up {} | {}",
        env!("CARGO_PKG_VERSION"),
        format_age(status.started_at),
        status.server_url,
    );

    let separator = "■".repeat(60).bright_black().to_string();
    println!("{separator}");

    let sync = &status.sync;
    println!(
        "{} {} | {} files | {} rounds ({} failed) | last event {}",
        "SYNC".bold(),
        if sync.polling {
            sync.phase.green().to_string()
        } else {
            sync.phase.red().to_string()
        },
        sync.file_count,
        sync.rounds,
        sync.failed_rounds,
        sync.last_event_time
            .map(format_age)
            .map_or_else(|| "never".to_string(), |age| format!("{age} ago")),
    );
    if let Some(err) = &sync.last_error {
        println!("  {} {}", "last error:".red(), err);
    }

    let render = &status.render;
    println!(
        "{} {} {:>3.0}% | entrypoint {} | engine {} | manual run {}",
        "RENDER".bold(),
        state_label(&render.state),
        render.progress * 100.0,
        status.entrypoint.as_deref().unwrap_or("-"),
        status.engine_version.as_deref().unwrap_or("default"),
        if status.manual_run { "on" } else { "off" },
    );
    if let Some(run) = render.last_run {
        let elements = render
            .last_artifact_elements
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        println!("  last run #{run}, {elements} circuit elements");
    }
    if let Some(failure) = &render.last_error {
        println!("  {} {}", format!("{} error:", failure.kind).red(), failure.message);
    }
    if status.pending_edits > 0 {
        println!("  {} edit events waiting to be saved", status.pending_edits);
    }

    if !status.render.phase_timings.is_empty() {
        let mut table = Table::new(status.render.phase_timings);
        table.with(Style::rounded());
        println!("{table}");
    }
    println!("{separator}");
}

fn state_label(state: &str) -> String {
    let label = state.to_uppercase();
    match state {
        "running" | "armed" => label.yellow().bold().to_string(),
        "settled" => label.green().bold().to_string(),
        "errored" => label.red().bold().to_string(),
        "cancelled" => label.magenta().bold().to_string(),
        _ => label.bright_black().bold().to_string(),
    }
}

fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0);
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 60 * 60 => format!("{}m", s / 60),
        s if s < 60 * 60 * 24 => format!("{}h", s / (60 * 60)),
        s => format!("{}d", s / (60 * 60 * 24)),
    }
}
