//! runframe: keep a remote circuit project rendered locally.
//!
//! # Usage
//!
//! ```text
//! runframe init [--server-url <url>] [--worker <argv>...] [--force]
//! runframe daemon start [--server-url <url>] [--json-logs]
//! runframe daemon stop|status
//! runframe status [--json]
//! runframe files
//! runframe run
//! runframe stop
//! runframe push <file> [--as <path>]
//! runframe edit <event-json>
//! runframe engine [<version>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, edit::EditArgs, engine::EngineArgs, init::InitArgs, push::PushArgs,
    status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "runframe",
    version,
    about = "Sync a remote circuit project and keep it rendered",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default ~/.runframe/config.yaml.
    Init(InitArgs),

    /// Run or query the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Show sync and render state.
    Status(StatusArgs),

    /// List files in the synced snapshot.
    Files,

    /// Request a render (honoured when `manual_run` is enabled).
    Run,

    /// Cancel the render in progress.
    Stop,

    /// Upload a local file into the remote project.
    Push(PushArgs),

    /// Submit an edit event as JSON.
    Edit(EditArgs),

    /// Switch the worker engine version.
    Engine(EngineArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Status(args) => args.run(),
        Commands::Files => commands::files::run(),
        Commands::Run => commands::render::run(),
        Commands::Stop => commands::render::stop(),
        Commands::Push(args) => args.run(),
        Commands::Edit(args) => args.run(),
        Commands::Engine(args) => args.run(),
    }
}
