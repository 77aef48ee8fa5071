//! `runframe files` — the synced snapshot as a table.

use anyhow::{Context, Result};
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use runframe_daemon::request_files;

#[derive(Debug, Deserialize)]
struct FilesPayload {
    files: Vec<FileRow>,
}

#[derive(Debug, Deserialize, Tabled)]
struct FileRow {
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "bytes")]
    bytes: usize,
    #[tabled(rename = "lines")]
    lines: usize,
}

pub fn run() -> Result<()> {
    let home = super::home()?;
    let Some(payload) = super::or_not_running(request_files(&home), "list files")? else {
        return Ok(());
    };

    let payload: FilesPayload =
        serde_json::from_value(payload).context("unexpected daemon files payload")?;
    if payload.files.is_empty() {
        println!("No files synced yet.");
        return Ok(());
    }

    let count = payload.files.len();
    let mut table = Table::new(payload.files);
    table.with(Style::rounded());
    println!("{table}");
    println!("{count} files");
    Ok(())
}
