//! The manual-edits persistence file.
//!
//! Committed edit events are appended to the `edit_events` array of a JSON
//! object. Any other top-level keys already in the file are preserved.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use runframe_core::EditEvent;

use crate::SyncError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualEditsFile {
    #[serde(default)]
    pub edit_events: Vec<EditEvent>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Parse the file; missing or blank content is an empty file.
pub fn parse(content: Option<&str>) -> Result<ManualEditsFile, SyncError> {
    match content {
        Some(text) if !text.trim().is_empty() => Ok(serde_json::from_str(text)?),
        _ => Ok(ManualEditsFile::default()),
    }
}

/// Append `events` to `content` and return the new file text.
pub fn append(content: Option<&str>, events: &[EditEvent]) -> Result<String, SyncError> {
    let mut file = parse(content)?;
    file.edit_events.extend(events.iter().cloned());
    Ok(serde_json::to_string_pretty(&file)?)
}
