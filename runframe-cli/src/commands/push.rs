//! `runframe push <file> [--as <path>]`

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use runframe_daemon::request_upsert;

#[derive(Args, Debug)]
pub struct PushArgs {
    /// Local file to upload.
    pub file: PathBuf,

    /// Remote path; defaults to the file name.
    #[arg(long = "as", value_name = "PATH")]
    pub remote_path: Option<String>,
}

impl PushArgs {
    pub fn run(self) -> Result<()> {
        let content = fs::read_to_string(&self.file)
            .with_context(|| format!("cannot read '{}'", self.file.display()))?;
        let remote_path = match self.remote_path {
            Some(path) => path,
            None => self
                .file
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .with_context(|| format!("'{}' has no file name", self.file.display()))?,
        };

        let home = super::home()?;
        let pushed = request_upsert(&home, &remote_path, &content);
        if super::or_not_running(pushed, "push file")?.is_some() {
            println!("✓ Pushed {} ({} bytes)", remote_path, content.len());
        }
        Ok(())
    }
}
