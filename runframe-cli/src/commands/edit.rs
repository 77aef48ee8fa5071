//! `runframe edit <event-json>`

use anyhow::{Context, Result};
use clap::Args;

use runframe_core::EditEvent;
use runframe_daemon::request_edit;

#[derive(Args, Debug)]
pub struct EditArgs {
    /// Edit event, e.g. `{"edit_event_id":"e1","in_progress":false,...}`.
    pub event: String,
}

impl EditArgs {
    pub fn run(self) -> Result<()> {
        let event: EditEvent =
            serde_json::from_str(&self.event).context("edit event is not valid JSON")?;
        let id = event.edit_event_id.clone();

        let home = super::home()?;
        if let Some(data) = super::or_not_running(request_edit(&home, event), "submit edit")? {
            let pending = data["pending"].as_bool().unwrap_or(false);
            println!(
                "edit '{id}' {}",
                if pending { "queued" } else { "submitted" }
            );
        }
        Ok(())
    }
}
