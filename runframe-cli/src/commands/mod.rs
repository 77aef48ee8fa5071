pub mod daemon;
pub mod edit;
pub mod engine;
pub mod files;
pub mod init;
pub mod push;
pub mod render;
pub mod status;

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;

use runframe_daemon::DaemonError;

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Print the not-running notice for `DaemonNotRunning`, propagate the rest.
pub(crate) fn or_not_running<T>(
    result: Result<T, DaemonError>,
    action: &str,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(DaemonError::DaemonNotRunning { .. }) => {
            println!("{}", "daemon is not running".yellow());
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("failed to {action}")),
    }
}
