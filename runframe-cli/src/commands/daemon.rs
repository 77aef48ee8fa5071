//! `runframe daemon` — foreground daemon lifecycle.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use runframe_daemon::paths::socket_path;
use runframe_daemon::{request_shutdown, request_status, start_blocking, DaemonError, StartOptions};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (sync poller + renderer + socket).
    Start(StartArgs),
    /// Ask a running daemon to shut down.
    Stop,
    /// Print the raw daemon status JSON.
    Status,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override `server_url` from the config file.
    #[arg(long)]
    pub server_url: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home()?;

    match command {
        DaemonCommand::Start(args) => {
            let options = StartOptions {
                server_url: args.server_url,
                json_logs: args.json_logs,
            };
            start_blocking(&home, options).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => {
            if super::or_not_running(request_shutdown(&home), "stop daemon")?.is_some() {
                println!("daemon shutdown requested");
            }
        }
        DaemonCommand::Status => {
            let payload = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render daemon status JSON")?
            );
        }
    }

    Ok(())
}
