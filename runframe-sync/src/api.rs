//! Boundary to the remote file store and event log.
//!
//! [`SyncApi`] is the only seam the [`RemoteSyncClient`](crate::RemoteSyncClient)
//! talks through; [`HttpSyncApi`](crate::http::HttpSyncApi) is the production
//! implementation and tests plug in an in-memory one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use runframe_core::{EventInput, RemoteEvent, RemoteFile};

use crate::SyncError;

/// Remote file store + event log operations.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// `GET /files/list`
    async fn list_files(&self) -> Result<Vec<RemoteFile>, SyncError>;

    /// `GET /files/get?file_path=`
    async fn get_file(&self, path: &str) -> Result<RemoteFile, SyncError>;

    /// `POST /files/upsert`
    async fn upsert_file(&self, path: &str, content: &str) -> Result<RemoteFile, SyncError>;

    /// `GET /events/list?since=`; `None` lists every event.
    async fn list_events(&self, since: Option<DateTime<Utc>>)
        -> Result<Vec<RemoteEvent>, SyncError>;

    /// `POST /events/create`
    async fn create_event(&self, input: &EventInput) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListResponse {
    pub file_list: Vec<RemoteFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResponse {
    pub file: Option<RemoteFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventListResponse {
    pub event_list: Vec<RemoteEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertFileRequest<'a> {
    pub file_path: &'a str,
    pub text_content: &'a str,
}
