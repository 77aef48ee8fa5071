//! Error types for runframe-sync.

use thiserror::Error;

/// All errors that can arise from talking to the remote file store / event log.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Request could not be sent or the server answered with a failure status.
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// Response body was not the expected JSON shape.
    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// The server does not know the requested file.
    #[error("file not found on server: {path}")]
    FileNotFound { path: String },

    /// JSON error while building or parsing a payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking request task panicked or was cancelled.
    #[error("request task failed: {0}")]
    Join(String),
}
