//! runframe core library — domain types, snapshot diffing, configuration.
//!
//! - [`types`] — snapshots, remote events, edit events, artifacts
//! - [`diff`] — the snapshot differ
//! - [`entrypoint`] — entrypoint detection
//! - [`config`] — YAML config load / save
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod diff;
pub mod entrypoint;
pub mod error;
pub mod types;

pub use config::{Config, WorkerConfig};
pub use diff::{diff, ChangeKind, ChangeSet, FileChange};
pub use error::ConfigError;
pub use types::{
    Artifact, EditEvent, EventInput, EventType, FileSnapshot, RemoteEvent, RemoteFile, RunId,
};
