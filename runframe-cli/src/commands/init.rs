//! `runframe init [--server-url <url>] [--worker <argv>...] [--force]`

use anyhow::{bail, Context, Result};
use clap::Args;

use runframe_core::config::{self, Config};

/// Write a default config file.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Remote file store and event log base URL.
    #[arg(long)]
    pub server_url: Option<String>,

    /// Worker program and arguments, e.g. `--worker node worker.js`.
    #[arg(long, num_args = 1.., value_name = "ARGV")]
    pub worker: Vec<String>,

    /// Entrypoint file, instead of auto-detection.
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Overwrite an existing config file.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let path = config::config_path_at(&home);
        if path.exists() && !self.force {
            bail!(
                "{} already exists; pass --force to overwrite",
                path.display()
            );
        }

        let mut config = Config::default();
        if let Some(url) = self.server_url {
            config.server_url = url;
        }
        config.worker.command = self.worker;
        config.entrypoint = self.entrypoint;
        config.validate().context("invalid configuration")?;

        config::save_at(&home, &config)
            .with_context(|| format!("failed to write {}", path.display()))?;

        println!("✓ Wrote {}", path.display());
        if config.worker.command.is_empty() {
            println!("  Set `worker.command` before running `runframe daemon start`.");
        }
        Ok(())
    }
}
