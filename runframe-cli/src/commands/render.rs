//! `runframe run` and `runframe stop`.

use anyhow::Result;
use colored::Colorize;

use runframe_daemon::{request_run, request_stop};

pub fn run() -> Result<()> {
    let home = super::home()?;
    let Some(data) = super::or_not_running(request_run(&home), "request a run")? else {
        return Ok(());
    };

    let trigger = data["trigger"].as_u64().unwrap_or_default();
    if data["manual_run"].as_bool().unwrap_or(false) {
        println!("run #{trigger} requested");
    } else {
        println!(
            "run #{trigger} recorded; {}",
            "manual_run is off, renders follow file changes only".yellow()
        );
    }
    Ok(())
}

pub fn stop() -> Result<()> {
    let home = super::home()?;
    if super::or_not_running(request_stop(&home), "stop the render")?.is_some() {
        println!("render stopped");
    }
    Ok(())
}
