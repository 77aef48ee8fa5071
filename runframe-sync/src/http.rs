//! [`SyncApi`] over HTTP with `ureq`.
//!
//! `ureq` is blocking, so every request runs on tokio's blocking pool the same
//! way the daemon runs its sync pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;

use runframe_core::{EventInput, RemoteEvent, RemoteFile};

use crate::api::{
    EventListResponse, FileListResponse, FileResponse, SyncApi, UpsertFileRequest,
};
use crate::SyncError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the file store and event log endpoints.
#[derive(Clone)]
pub struct HttpSyncApi {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpSyncApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self { base_url, agent }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base_url)
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn list_files(&self) -> Result<Vec<RemoteFile>, SyncError> {
        let url = self.url("/files/list");
        let agent = self.agent.clone();
        let response: FileListResponse =
            blocking(move || decode(&url, agent.get(&url).call())).await?;
        Ok(response.file_list)
    }

    async fn get_file(&self, path: &str) -> Result<RemoteFile, SyncError> {
        let url = self.url("/files/get");
        let agent = self.agent.clone();
        let file_path = path.to_string();
        let response: FileResponse = blocking(move || {
            let result = agent.get(&url).query("file_path", &file_path).call();
            match result {
                Err(ureq::Error::Status(404, _)) => Err(SyncError::FileNotFound { path: file_path }),
                other => decode(&url, other),
            }
        })
        .await?;
        response.file.ok_or_else(|| SyncError::FileNotFound {
            path: path.to_string(),
        })
    }

    async fn upsert_file(&self, path: &str, content: &str) -> Result<RemoteFile, SyncError> {
        let url = self.url("/files/upsert");
        let agent = self.agent.clone();
        let body = serde_json::to_value(UpsertFileRequest {
            file_path: path,
            text_content: content,
        })?;
        let response: FileResponse =
            blocking(move || decode(&url, agent.post(&url).send_json(body))).await?;
        response.file.ok_or_else(|| SyncError::FileNotFound {
            path: path.to_string(),
        })
    }

    async fn list_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteEvent>, SyncError> {
        let url = self.url("/events/list");
        let agent = self.agent.clone();
        let response: EventListResponse = blocking(move || {
            let mut request = agent.get(&url);
            if let Some(since) = since {
                request = request.query("since", &since.to_rfc3339_opts(SecondsFormat::Millis, true));
            }
            decode(&url, request.call())
        })
        .await?;
        Ok(response.event_list)
    }

    async fn create_event(&self, input: &EventInput) -> Result<(), SyncError> {
        let url = self.url("/events/create");
        let agent = self.agent.clone();
        let body = serde_json::to_value(input)?;
        blocking(move || {
            agent
                .post(&url)
                .send_json(body)
                .map(|_| ())
                .map_err(|err| transport(&url, err))
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| SyncError::Join(err.to_string()))?
}

fn decode<T: DeserializeOwned>(
    url: &str,
    result: Result<ureq::Response, ureq::Error>,
) -> Result<T, SyncError> {
    let response = result.map_err(|err| transport(url, err))?;
    response.into_json::<T>().map_err(|source| SyncError::Decode {
        url: url.to_string(),
        source,
    })
}

fn transport(url: &str, err: ureq::Error) -> SyncError {
    let message = match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            if body.is_empty() {
                format!("HTTP {code}")
            } else {
                format!("HTTP {code}: {}", body.trim())
            }
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    };
    SyncError::Transport {
        url: url.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = HttpSyncApi::new("http://localhost:3020/");
        assert_eq!(api.base_url(), "http://localhost:3020");
        assert_eq!(api.url("/files/list"), "http://localhost:3020/files/list");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        // Port 9 (discard) on loopback is closed in test environments.
        let api = HttpSyncApi::new("http://127.0.0.1:9");
        let err = api.list_events(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }), "got: {err}");
        assert!(err.to_string().contains("/events/list"));
    }
}
