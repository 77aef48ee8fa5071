//! Domain types shared by the sync client and the render orchestrator.
//!
//! [`FileSnapshot`] is copy-on-write: every mutating helper returns a new
//! snapshot and leaves the shared one untouched, so a snapshot handed to a
//! render run can never change underneath it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of a single render attempt. Monotonic per orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for RunId {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

// ---------------------------------------------------------------------------
// FileSnapshot
// ---------------------------------------------------------------------------

/// Full state of the user's file set at a point in time: path → content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSnapshot(Arc<HashMap<String, String>>);

impl FileSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Paths in lexicographic order.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.0.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// New snapshot with `path` set to `content`.
    pub fn with_file(&self, path: impl Into<String>, content: impl Into<String>) -> Self {
        let mut files = (*self.0).clone();
        files.insert(path.into(), content.into());
        Self(Arc::new(files))
    }

    /// New snapshot with `updates` applied in order on top of `self`.
    /// `None` content removes the path.
    pub fn patched<I, P, C>(&self, updates: I) -> Self
    where
        I: IntoIterator<Item = (P, Option<C>)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut files = (*self.0).clone();
        for (path, content) in updates {
            match content {
                Some(content) => {
                    files.insert(path.into(), content.into());
                }
                None => {
                    files.remove(&path.into());
                }
            }
        }
        Self(Arc::new(files))
    }

    /// True when both handles point at the same underlying map.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<HashMap<String, String>> for FileSnapshot {
    fn from(files: HashMap<String, String>) -> Self {
        Self(Arc::new(files))
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for FileSnapshot {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        Self(Arc::new(
            iter.into_iter().map(|(p, c)| (p.into(), c.into())).collect(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Remote events
// ---------------------------------------------------------------------------

/// Tag of a remote event. Unrecognised tags deserialize as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    FileUpdated,
    RequestToSaveSnippet,
    SnippetSaved,
    FailedToSaveSnippet,
    RequestToDownloadBoard,
    #[serde(other)]
    Unknown,
}

/// An entry of the server-side event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    /// Type-specific fields (e.g. `file_path` for `FILE_UPDATED`).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RemoteEvent {
    pub fn is_file_updated(&self) -> bool {
        self.event_type == EventType::FileUpdated
    }

    pub fn file_path(&self) -> Option<&str> {
        self.fields.get("file_path").and_then(Value::as_str)
    }
}

/// Payload for appending a new event to the remote log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    pub event_type: EventType,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventInput {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A file as returned by the remote file store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    #[serde(default)]
    pub file_id: String,
    pub file_path: String,
    #[serde(default)]
    pub text_content: String,
}

// ---------------------------------------------------------------------------
// Edit events
// ---------------------------------------------------------------------------

/// One interactive mutation, e.g. a single frame of dragging a placed part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEvent {
    #[serde(default)]
    pub edit_event_id: String,
    pub in_progress: bool,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EditEvent {
    pub fn new(edit_event_id: impl Into<String>, in_progress: bool) -> Self {
        Self {
            edit_event_id: edit_event_id.into(),
            in_progress,
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Circuit JSON produced by a worker: a flat list of circuit elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(pub Vec<Value>);

impl Artifact {
    pub fn elements(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
