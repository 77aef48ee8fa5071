//! `runframe engine [<version>]`

use anyhow::Result;
use clap::Args;

use runframe_daemon::request_engine;

#[derive(Args, Debug)]
pub struct EngineArgs {
    /// Engine version to run renders with; omit to restore the default.
    pub version: Option<String>,
}

impl EngineArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let changed = request_engine(&home, self.version.as_deref());
        if let Some(data) = super::or_not_running(changed, "switch engine version")? {
            let version = data["engine_version"].as_str().unwrap_or("default");
            println!("engine version: {version} (next render uses a fresh worker)");
        }
        Ok(())
    }
}
