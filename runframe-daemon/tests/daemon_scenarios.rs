//! Daemon wiring: remote and local file changes drive renders, committed
//! edits are persisted between renders, and the control socket answers
//! requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;

use runframe_core::{
    Artifact, Config, EditEvent, EventInput, EventType, FileSnapshot, RemoteEvent, RemoteFile,
};
use runframe_daemon::{
    paths::socket_path, request_status, request_upsert, send_request, serve, Daemon,
    DaemonRequest,
};
use runframe_render::{CircuitWorker, LifecycleEvent, RenderUpdate, WorkerError, WorkerFactory};
use runframe_sync::{manual_edits, SyncApi, SyncError};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeServer {
    files: Mutex<HashMap<String, String>>,
    events: Mutex<Vec<RemoteEvent>>,
}

impl FakeServer {
    fn put(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        let mut events = self.events.lock().unwrap();
        let n = events.len() as i64 + 1;
        let mut fields = Map::new();
        fields.insert("file_path".to_string(), path.into());
        events.push(RemoteEvent {
            event_id: format!("evt-{n}"),
            event_type: EventType::FileUpdated,
            created_at: Utc.timestamp_opt(1_700_000_000 + n, 0).unwrap(),
            fields,
        });
    }

    fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl SyncApi for FakeServer {
    async fn list_files(&self) -> Result<Vec<RemoteFile>, SyncError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(path, content)| RemoteFile {
                file_id: path.clone(),
                file_path: path.clone(),
                text_content: content.clone(),
            })
            .collect())
    }

    async fn get_file(&self, path: &str) -> Result<RemoteFile, SyncError> {
        let content = self.file(path).ok_or_else(|| SyncError::FileNotFound {
            path: path.to_string(),
        })?;
        Ok(RemoteFile {
            file_id: path.to_string(),
            file_path: path.to_string(),
            text_content: content,
        })
    }

    async fn upsert_file(&self, path: &str, content: &str) -> Result<RemoteFile, SyncError> {
        self.put(path, content);
        self.get_file(path).await
    }

    async fn list_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteEvent>, SyncError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| since.map_or(true, |since| e.created_at > since))
            .cloned()
            .collect())
    }

    async fn create_event(&self, _input: &EventInput) -> Result<(), SyncError> {
        Ok(())
    }
}

struct CountingWorker {
    compiled: Arc<AtomicUsize>,
    events: broadcast::Sender<LifecycleEvent>,
}

#[async_trait]
impl CircuitWorker for CountingWorker {
    async fn execute_with_fs_map(&self, _: &str, _: &FileSnapshot) -> Result<(), WorkerError> {
        self.compiled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_circuit_json(&self) -> Result<Artifact, WorkerError> {
        Ok(Artifact(vec![Value::from("source_component")]))
    }

    async fn render_until_settled(&self) -> Result<(), WorkerError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }

    fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    async fn kill(&self) {}
}

#[derive(Default)]
struct CountingFactory {
    compiled: Arc<AtomicUsize>,
    versions: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl WorkerFactory for CountingFactory {
    async fn spawn(&self, version: Option<&str>) -> Result<Arc<dyn CircuitWorker>, WorkerError> {
        self.versions
            .lock()
            .unwrap()
            .push(version.map(str::to_string));
        Ok(Arc::new(CountingWorker {
            compiled: Arc::clone(&self.compiled),
            events: broadcast::channel(16).0,
        }))
    }
}

fn config() -> Config {
    Config {
        poll_interval_ms: 20,
        edit_flush_delay_ms: 10,
        ..Config::default()
    }
}

async fn next_finished(updates: &mut broadcast::Receiver<RenderUpdate>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match updates.recv().await {
                Ok(RenderUpdate::Finished { .. }) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("orchestrator gone"),
            }
        }
    })
    .await
    .expect("render finished in time");
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_changes_drive_renders() {
    let home = TempDir::new().expect("home");
    let server = Arc::new(FakeServer::default());
    server.put("index.tsx", "<board width=\"10mm\"/>");
    let factory = Arc::new(CountingFactory::default());
    let compiled = Arc::clone(&factory.compiled);

    let daemon = Daemon::new(Arc::clone(&server), factory, config());
    let mut updates = daemon.orchestrator().subscribe();
    let serving = tokio::spawn(serve(Arc::clone(&daemon), home.path().to_path_buf()));

    // Initial load renders exactly once.
    next_finished(&mut updates).await;
    assert_eq!(compiled.load(Ordering::SeqCst), 1);

    // Idle polls change nothing and trigger nothing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(compiled.load(Ordering::SeqCst), 1);

    // A remote write is polled in and re-renders.
    server.put("index.tsx", "<board width=\"12mm\"/>");
    next_finished(&mut updates).await;
    assert_eq!(compiled.load(Ordering::SeqCst), 2);
    assert_eq!(
        daemon.sync().snapshot().get("index.tsx"),
        Some("<board width=\"12mm\"/>")
    );

    let home_path = home.path().to_path_buf();
    tokio::task::spawn_blocking(move || runframe_daemon::request_shutdown(&home_path))
        .await
        .expect("join")
        .expect("shutdown");
    serving.await.expect("join").expect("daemon exits cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_upsert_drives_a_rerender() {
    let home = TempDir::new().expect("home");
    let server = Arc::new(FakeServer::default());
    server.put("main.tsx", "<board/>");
    let factory = Arc::new(CountingFactory::default());
    let compiled = Arc::clone(&factory.compiled);

    let daemon = Daemon::new(Arc::clone(&server), factory, config());
    let mut updates = daemon.orchestrator().subscribe();
    let serving = tokio::spawn(serve(Arc::clone(&daemon), home.path().to_path_buf()));

    next_finished(&mut updates).await;
    assert_eq!(compiled.load(Ordering::SeqCst), 1);

    daemon
        .upsert("main.tsx", "<board width=\"2mm\"/>")
        .await
        .expect("upsert");
    next_finished(&mut updates).await;
    assert_eq!(compiled.load(Ordering::SeqCst), 2);
    assert_eq!(
        server.file("main.tsx").as_deref(),
        Some("<board width=\"2mm\"/>")
    );

    // The server echo of our write carries the same content.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(compiled.load(Ordering::SeqCst), 2);

    let home_path = home.path().to_path_buf();
    tokio::task::spawn_blocking(move || runframe_daemon::request_shutdown(&home_path))
        .await
        .expect("join")
        .expect("shutdown");
    serving.await.expect("join").expect("daemon exits cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_switch_replaces_the_worker_on_next_run() {
    let home = TempDir::new().expect("home");
    let server = Arc::new(FakeServer::default());
    server.put("index.tsx", "<board/>");
    let factory = Arc::new(CountingFactory::default());

    let daemon = Daemon::new(Arc::clone(&server), factory.clone(), config());
    let mut updates = daemon.orchestrator().subscribe();
    let serving = tokio::spawn(serve(Arc::clone(&daemon), home.path().to_path_buf()));
    next_finished(&mut updates).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let switched = daemon
        .handle(
            DaemonRequest {
                version: Some("0.2.0".into()),
                ..DaemonRequest::command("engine")
            },
            home.path(),
            &shutdown_tx,
        )
        .await;
    assert_eq!(switched.data.expect("data")["engine_version"], "0.2.0");
    let status = daemon.status_payload(home.path()).await;
    assert_eq!(status["engine_version"], "0.2.0");

    daemon
        .upsert("index.tsx", "<board width=\"3mm\"/>")
        .await
        .expect("upsert");
    next_finished(&mut updates).await;
    assert_eq!(
        *factory.versions.lock().unwrap(),
        vec![None, Some("0.2.0".to_string())]
    );

    let home_path = home.path().to_path_buf();
    tokio::task::spawn_blocking(move || runframe_daemon::request_shutdown(&home_path))
        .await
        .expect("join")
        .expect("shutdown");
    serving.await.expect("join").expect("daemon exits cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn committed_edits_are_persisted_to_manual_edits_file() {
    let home = TempDir::new().expect("home");
    let server = Arc::new(FakeServer::default());
    server.put("index.tsx", "<board/>");
    let daemon = Daemon::new(
        Arc::clone(&server),
        Arc::new(CountingFactory::default()),
        config(),
    );
    let mut updates = daemon.orchestrator().subscribe();
    let serving = tokio::spawn(serve(Arc::clone(&daemon), home.path().to_path_buf()));
    next_finished(&mut updates).await;

    for frame in 0..5 {
        daemon.push_edit(EditEvent::new("drag-1", true).with_field("frame", frame));
    }
    daemon.push_edit(EditEvent::new("drag-1", false).with_field("frame", 5));

    eventually("manual edits on server", || {
        server.file("manual-edits.json").is_some()
    })
    .await;
    let saved = manual_edits::parse(server.file("manual-edits.json").as_deref()).expect("parse");
    assert_eq!(saved.edit_events.len(), 1, "only the terminal event is committed");
    assert_eq!(saved.edit_events[0].payload["frame"], 5);

    let home_path = home.path().to_path_buf();
    tokio::task::spawn_blocking(move || runframe_daemon::request_shutdown(&home_path))
        .await
        .expect("join")
        .expect("shutdown");
    serving.await.expect("join").expect("daemon exits cleanly");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn control_socket_round_trip() {
    let home = TempDir::new().expect("home");
    let server = Arc::new(FakeServer::default());
    let daemon = Daemon::new(
        Arc::clone(&server),
        Arc::new(CountingFactory::default()),
        config(),
    );
    let serving = tokio::spawn(serve(Arc::clone(&daemon), home.path().to_path_buf()));

    let socket = socket_path(home.path());
    eventually("socket bound", || socket.exists()).await;

    let home_path = home.path().to_path_buf();
    let (status, upsert, unknown) = tokio::task::spawn_blocking(move || {
        let status = request_status(&home_path).expect("status");
        let upsert = request_upsert(&home_path, "index.tsx", "<board/>").expect("upsert");
        let unknown = send_request(&home_path, &DaemonRequest::command("launch")).expect("reply");
        runframe_daemon::request_shutdown(&home_path).expect("shutdown");
        (status, upsert, unknown)
    })
    .await
    .expect("join");

    assert_eq!(status["running"], true);
    assert_eq!(status["manual_run"], false);
    assert_eq!(status["render"]["state"], "idle");
    assert_eq!(upsert["file_path"], "index.tsx");
    assert!(!unknown.ok);
    assert!(unknown.error.unwrap_or_default().contains("unknown command"));
    assert_eq!(server.file("index.tsx").as_deref(), Some("<board/>"));

    serving.await.expect("join").expect("daemon exits cleanly");
    assert!(!socket.exists(), "socket removed on shutdown");
}

#[tokio::test]
async fn handle_validates_request_fields() {
    let home = TempDir::new().expect("home");
    let daemon = Daemon::new(
        Arc::new(FakeServer::default()),
        Arc::new(CountingFactory::default()),
        config(),
    );
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

    let edit = daemon
        .handle(DaemonRequest::command("edit"), home.path(), &shutdown_tx)
        .await;
    assert!(!edit.ok);

    let upsert = daemon
        .handle(
            DaemonRequest {
                path: Some("index.tsx".into()),
                ..DaemonRequest::command("upsert")
            },
            home.path(),
            &shutdown_tx,
        )
        .await;
    assert!(!upsert.ok);

    let run = daemon
        .handle(DaemonRequest::command("run"), home.path(), &shutdown_tx)
        .await;
    assert_eq!(run.data.expect("data")["trigger"], 1);

    let files = daemon
        .handle(DaemonRequest::command("files"), home.path(), &shutdown_tx)
        .await;
    assert_eq!(files.data.expect("data")["files"], Value::Array(vec![]));

    let shutdown = daemon
        .handle(DaemonRequest::command("shutdown"), home.path(), &shutdown_tx)
        .await;
    assert!(shutdown.ok);
    shutdown_rx.recv().await.expect("shutdown signalled");
}
