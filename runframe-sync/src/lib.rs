//! # runframe-sync
//!
//! Keeps a local file snapshot in sync with a remote file store.
//!
//! [`RemoteSyncClient`] polls the remote event log through a [`SyncApi`]
//! (production: [`HttpSyncApi`]) and publishes every snapshot replacement on
//! a watch channel. [`EditDebouncer`] collapses interactive edit gestures
//! before they are written back through the client.

pub mod api;
pub mod client;
pub mod debounce;
pub mod error;
pub mod event_log;
pub mod http;
pub mod manual_edits;

pub use api::SyncApi;
pub use client::{RemoteSyncClient, SyncOptions, SyncPhase, SyncStatus};
pub use debounce::EditDebouncer;
pub use error::SyncError;
pub use event_log::EventLog;
pub use http::HttpSyncApi;
