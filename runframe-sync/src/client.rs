//! Remote sync client — owns the canonical [`FileSnapshot`].
//!
//! ## Poll round
//!
//! 1. List events newer than the watermark (all events on the first round).
//! 2. Empty → back to `Idle`.
//! 3. For each `FILE_UPDATED` event fetch the file, unless it is our own
//!    recent write of the manual-edits file. A file the server no longer has
//!    is dropped from the snapshot.
//! 4. Publish the merged snapshot (copy-on-write) if any content changed.
//! 5. Advance the watermark to the last event's `created_at`, never backward.
//! 6. Append every event to the capped log.
//!
//! A failed round changes nothing except `last_error`; the loop keeps going
//! and the next round asks for the same events again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use runframe_core::{diff, Config, EventInput, FileSnapshot, RemoteEvent, RemoteFile};

use crate::api::SyncApi;
use crate::event_log::EventLog;
use crate::SyncError;

/// Tunables for [`RemoteSyncClient`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub poll_interval: Duration,
    pub self_write_window: Duration,
    pub event_log_capacity: usize,
    pub manual_edits_path: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            self_write_window: config.self_write_window(),
            event_log_capacity: config.event_log_capacity,
            manual_edits_path: config.manual_edits_path.clone(),
        }
    }
}

/// Where the poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Polling,
    Merging,
    Stopped,
}

/// Point-in-time view of the client, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub polling: bool,
    pub last_event_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub file_count: usize,
    pub logged_events: usize,
    pub event_log_capacity: usize,
    pub rounds: u64,
    pub failed_rounds: u64,
}

struct SyncState {
    phase: SyncPhase,
    last_event_time: Option<DateTime<Utc>>,
    log: EventLog,
    last_error: Option<String>,
    last_self_write: Option<Instant>,
    rounds: u64,
    failed_rounds: u64,
}

/// Keeps a local [`FileSnapshot`] in sync with the remote file store.
pub struct RemoteSyncClient<A> {
    api: Arc<A>,
    options: SyncOptions,
    snapshot: watch::Sender<FileSnapshot>,
    state: Mutex<SyncState>,
    poller: Mutex<Option<CancellationToken>>,
}

impl<A: SyncApi + 'static> RemoteSyncClient<A> {
    pub fn new(api: A, options: SyncOptions) -> Self {
        Self::with_shared_api(Arc::new(api), options)
    }

    pub fn with_shared_api(api: Arc<A>, options: SyncOptions) -> Self {
        let (snapshot, _) = watch::channel(FileSnapshot::new());
        let state = SyncState {
            phase: SyncPhase::Idle,
            last_event_time: None,
            log: EventLog::new(options.event_log_capacity),
            last_error: None,
            last_self_write: None,
            rounds: 0,
            failed_rounds: 0,
        };
        Self {
            api,
            options,
            snapshot,
            state: Mutex::new(state),
            poller: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> FileSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every wholesale snapshot replacement.
    pub fn subscribe(&self) -> watch::Receiver<FileSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.state().last_event_time
    }

    pub fn recent_events(&self) -> Vec<RemoteEvent> {
        self.state().log.to_vec()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        self.state().phase
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.poller).is_some()
    }

    pub fn status(&self) -> SyncStatus {
        let polling = self.is_polling();
        let file_count = self.snapshot.borrow().len();
        let state = self.state();
        SyncStatus {
            phase: state.phase,
            polling,
            last_event_time: state.last_event_time,
            last_error: state.last_error.clone(),
            file_count,
            logged_events: state.log.len(),
            event_log_capacity: state.log.capacity(),
            rounds: state.rounds,
            failed_rounds: state.failed_rounds,
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// One-shot full fetch; replaces the snapshot wholesale.
    pub async fn load_initial_files(&self) -> Result<FileSnapshot, SyncError> {
        let files = self.api.list_files().await?;
        let snapshot: FileSnapshot = files
            .into_iter()
            .map(|file| (file.file_path, file.text_content))
            .collect();
        self.snapshot.send_replace(snapshot.clone());
        tracing::info!(files = snapshot.len(), "loaded initial files");
        Ok(snapshot)
    }

    /// Optimistic local write followed by the remote write.
    ///
    /// The local snapshot keeps the new content even if the remote write
    /// fails; the next poll that touches the path wins.
    pub async fn upsert_file(&self, path: &str, content: &str) -> Result<RemoteFile, SyncError> {
        self.snapshot.send_if_modified(|current| {
            if current.get(path) == Some(content) {
                return false;
            }
            *current = current.with_file(path, content);
            true
        });

        let is_manual_edits = path == self.options.manual_edits_path;
        if is_manual_edits {
            self.state().last_self_write = Some(Instant::now());
        }

        let result = self.api.upsert_file(path, content).await;
        match &result {
            Ok(_) => {
                if is_manual_edits {
                    // The server echo arrives after the write completes.
                    self.state().last_self_write = Some(Instant::now());
                }
                tracing::debug!(path, bytes = content.len(), "upserted file");
            }
            Err(err) => tracing::warn!(path, error = %err, "remote upsert failed"),
        }
        result
    }

    /// Fire-and-forget append to the remote event log.
    ///
    /// Failures are logged; the returned handle may be ignored.
    pub fn push_event(&self, input: EventInput) -> JoinHandle<()> {
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(err) = api.create_event(&input).await {
                tracing::warn!(event_type = ?input.event_type, error = %err, "failed to push event");
            }
        })
    }

    /// Run a single poll round and record its outcome.
    pub async fn poll_once(&self) -> Result<usize, SyncError> {
        let result = self.poll_round().await;
        let mut state = self.state();
        state.rounds += 1;
        if state.phase != SyncPhase::Stopped {
            state.phase = SyncPhase::Idle;
        }
        match &result {
            Ok(_) => state.last_error = None,
            Err(err) => {
                state.failed_rounds += 1;
                state.last_error = Some(err.to_string());
            }
        }
        result
    }

    /// Start the background poll loop. Returns `None` if already polling.
    pub fn start_polling(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let token = {
            let mut poller = lock(&self.poller);
            if poller.is_some() {
                return None;
            }
            let token = CancellationToken::new();
            *poller = Some(token.clone());
            token
        };
        self.set_phase(SyncPhase::Idle);
        tracing::info!(interval_ms = self.options.poll_interval.as_millis() as u64, "polling started");

        let client = Arc::clone(self);
        Some(tokio::spawn(async move { client.poll_loop(token).await }))
    }

    /// Stop the poll loop. An in-flight round is abandoned without merging.
    pub fn stop_polling(&self) {
        if let Some(token) = lock(&self.poller).take() {
            token.cancel();
            tracing::info!("polling stopped");
        }
        self.set_phase(SyncPhase::Stopped);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn poll_loop(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                result = self.poll_once() => {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "poll round failed; retrying next tick");
                    }
                }
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
        self.set_phase(SyncPhase::Stopped);
    }

    async fn poll_round(&self) -> Result<usize, SyncError> {
        let since = {
            let mut state = self.state();
            state.phase = SyncPhase::Polling;
            state.last_event_time
        };

        let events = self.api.list_events(since).await?;
        if events.is_empty() {
            return Ok(0);
        }

        self.set_phase(SyncPhase::Merging);
        let mut updates = Vec::new();
        for event in events.iter().filter(|event| event.is_file_updated()) {
            let Some(path) = event.file_path() else {
                tracing::warn!(event_id = %event.event_id, "FILE_UPDATED event without file_path");
                continue;
            };
            if self.is_recent_self_write(path) {
                tracing::debug!(path, "discarding remote echo of our own write");
                continue;
            }
            match self.api.get_file(path).await {
                Ok(file) => updates.push((file.file_path, Some(file.text_content))),
                // Deleted after the event was logged.
                Err(SyncError::FileNotFound { .. }) => {
                    tracing::warn!(path, event_id = %event.event_id, "updated file no longer exists; dropping it");
                    updates.push((path.to_string(), None));
                }
                Err(err) => return Err(err),
            }
        }

        if !updates.is_empty() {
            self.snapshot.send_if_modified(|current| {
                let next = current.patched(updates);
                let changes = diff(current, &next);
                if changes.is_empty() {
                    return false;
                }
                tracing::info!(changed = changes.len(), "merged remote file updates");
                *current = next;
                true
            });
        }

        let count = events.len();
        let mut state = self.state();
        if let Some(last) = events.last().map(|event| event.created_at) {
            if state.last_event_time.map_or(true, |current| last > current) {
                state.last_event_time = Some(last);
            }
        }
        state.log.extend(events);
        Ok(count)
    }

    fn is_recent_self_write(&self, path: &str) -> bool {
        if path != self.options.manual_edits_path {
            return false;
        }
        self.state()
            .last_self_write
            .is_some_and(|at| at.elapsed() < self.options.self_write_window)
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.state().phase = phase;
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        lock(&self.state)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
