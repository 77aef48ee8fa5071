use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use runframe_core::{
    config, entrypoint, Config, ConfigError, EditEvent, FileSnapshot, RemoteFile,
};
use runframe_render::{
    OrchestratorOptions, ProcessWorkerFactory, RenderOrchestrator, RunInput, WorkerFactory,
    WorkerPool,
};
use runframe_sync::{
    manual_edits, EditDebouncer, HttpSyncApi, RemoteSyncClient, SyncApi, SyncOptions,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub server_url: Option<String>,
    pub json_logs: bool,
}

/// The sync client, render orchestrator and edit debouncer wired together.
pub struct Daemon<A> {
    config: Config,
    sync: Arc<RemoteSyncClient<A>>,
    orchestrator: Arc<RenderOrchestrator>,
    debouncer: EditDebouncer,
    committed: Mutex<Option<mpsc::UnboundedReceiver<EditEvent>>>,
    trigger: watch::Sender<u64>,
    started_at: DateTime<Utc>,
}

impl<A: SyncApi + 'static> Daemon<A> {
    pub fn new(api: Arc<A>, factory: Arc<dyn WorkerFactory>, config: Config) -> Arc<Self> {
        let sync = Arc::new(RemoteSyncClient::with_shared_api(
            api,
            SyncOptions::from(&config),
        ));
        let pool = Arc::new(WorkerPool::new(factory, config.worker.engine_version.clone()));
        let orchestrator = Arc::new(RenderOrchestrator::new(
            pool,
            OrchestratorOptions::from(&config),
        ));
        let (debouncer, committed) = EditDebouncer::new(config.edit_flush_delay());
        let (trigger, _) = watch::channel(0);

        Arc::new(Self {
            config,
            sync,
            orchestrator,
            debouncer,
            committed: Mutex::new(Some(committed)),
            trigger,
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sync(&self) -> &Arc<RemoteSyncClient<A>> {
        &self.sync
    }

    pub fn orchestrator(&self) -> &Arc<RenderOrchestrator> {
        &self.orchestrator
    }

    /// Bump the manual run trigger and return its new value.
    pub fn request_run(&self) -> u64 {
        let mut value = 0;
        self.trigger.send_modify(|n| {
            *n += 1;
            value = *n;
        });
        value
    }

    pub async fn stop_render(&self) {
        self.orchestrator.stop().await;
    }

    pub fn push_edit(&self, event: EditEvent) {
        self.debouncer.push(event);
    }

    /// Switch the worker engine version and return the one now in effect.
    /// A change replaces the worker on the next run.
    pub async fn set_engine_version(&self, version: Option<String>) -> Option<String> {
        let pool = self.orchestrator.pool();
        pool.set_engine_version(version).await;
        pool.engine_version().await
    }

    pub async fn upsert(&self, path: &str, content: &str) -> Result<RemoteFile, DaemonError> {
        Ok(self.sync.upsert_file(path, content).await?)
    }

    /// Load the remote file set and start polling.
    ///
    /// A failed initial load is logged; the poll loop fills the snapshot in
    /// from the event log once the server is reachable.
    pub async fn start_sync(&self) -> Option<JoinHandle<()>> {
        match self.sync.load_initial_files().await {
            Ok(snapshot) => tracing::info!(files = snapshot.len(), "loaded initial file set"),
            Err(err) => tracing::warn!(error = %err, "initial file load failed"),
        }
        self.sync.start_polling()
    }

    async fn dispatch(&self, snapshot: FileSnapshot, trigger: u64) {
        let entrypoint = entrypoint::detect(&snapshot, self.config.entrypoint.as_deref());
        let input = RunInput {
            snapshot,
            entrypoint,
            trigger,
        };
        // Outcomes are observed through the orchestrator's update stream.
        let _ = self.orchestrator.submit(input).await;
    }

    /// Write committed edit events into the manual-edits file.
    ///
    /// Skipped while a render runs; the events stay batched until it ends.
    /// Returns whether anything was written.
    pub async fn persist_edits(&self) -> Result<bool, DaemonError> {
        if self.orchestrator.is_running() {
            return Ok(false);
        }
        let batch = self.debouncer.mark_batch_started();
        if batch.is_empty() {
            return Ok(false);
        }

        let path = self.config.manual_edits_path.as_str();
        let current = self.sync.snapshot().get(path).map(str::to_string);
        let content = match manual_edits::append(current.as_deref(), &batch) {
            Ok(content) => content,
            Err(err) => {
                self.debouncer.mark_batch_complete();
                return Err(err.into());
            }
        };

        // The local copy is written even when the remote write fails, and the
        // next batch is appended to it, so the batch is done either way.
        let written = self.sync.upsert_file(path, &content).await;
        self.debouncer.mark_batch_complete();
        written?;
        tracing::info!(events = batch.len(), path, "persisted edit events");
        Ok(true)
    }

    pub async fn status_payload(&self, home: &Path) -> Value {
        let engine_version = self.orchestrator.pool().engine_version().await;
        let snapshot = self.sync.snapshot();
        json!({
            "running": true,
            "started_at": self.started_at.to_rfc3339(),
            "server_url": self.config.server_url,
            "socket": socket_path(home).display().to_string(),
            "entrypoint": entrypoint::detect(&snapshot, self.config.entrypoint.as_deref()),
            "manual_run": self.config.manual_run,
            "engine_version": engine_version,
            "trigger": *self.trigger.borrow(),
            "pending_edits": self.debouncer.current_batch().len(),
            "sync": self.sync.status(),
            "render": self.orchestrator.status(),
        })
    }

    pub fn files_payload(&self) -> Value {
        let snapshot = self.sync.snapshot();
        let files: Vec<Value> = snapshot
            .paths()
            .into_iter()
            .map(|path| {
                let content = snapshot.get(path).unwrap_or_default();
                json!({
                    "path": path,
                    "bytes": content.len(),
                    "lines": content.lines().count(),
                })
            })
            .collect();
        json!({ "files": files })
    }

    /// Answer one control request.
    pub async fn handle(
        &self,
        request: DaemonRequest,
        home: &Path,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> DaemonResponse {
        match request.cmd.as_str() {
            "status" => DaemonResponse::ok(self.status_payload(home).await),
            "files" => DaemonResponse::ok(self.files_payload()),
            "run" => {
                let trigger = self.request_run();
                DaemonResponse::ok(json!({
                    "trigger": trigger,
                    "manual_run": self.config.manual_run,
                }))
            }
            "stop" => {
                self.stop_render().await;
                DaemonResponse::ok(json!({ "stopped": true }))
            }
            "edit" => match request.event {
                Some(event) => {
                    self.push_edit(event);
                    DaemonResponse::ok(json!({ "pending": self.debouncer.has_pending() }))
                }
                None => DaemonResponse::error("edit requires an `event`"),
            },
            "upsert" => match (request.path, request.content) {
                (Some(path), Some(content)) => match self.upsert(&path, &content).await {
                    Ok(file) => DaemonResponse::ok(json!({ "file_path": file.file_path })),
                    Err(err) => DaemonResponse::error(err.to_string()),
                },
                _ => DaemonResponse::error("upsert requires `path` and `content`"),
            },
            "engine" => {
                let version = self.set_engine_version(request.version).await;
                DaemonResponse::ok(json!({ "engine_version": version }))
            }
            "shutdown" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        }
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, options: StartOptions) -> Result<(), DaemonError> {
    init_tracing(options.json_logs);

    let mut config = config::load_at(home)?;
    if let Some(url) = options.server_url {
        config.server_url = url;
    }
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the daemon against the configured server and worker command.
pub async fn run(home: PathBuf, config: Config) -> Result<(), DaemonError> {
    if config.worker.command.is_empty() {
        return Err(ConfigError::Invalid {
            field: "worker.command",
            reason: "must name the worker program".to_string(),
        }
        .into());
    }
    let api = Arc::new(HttpSyncApi::new(config.server_url.clone()));
    let factory = Arc::new(ProcessWorkerFactory::new(config.worker.command.clone()));
    tracing::info!(server_url = %config.server_url, "starting runframe daemon");
    serve(Daemon::new(api, factory, config), home).await
}

/// Run every daemon task until shutdown is requested.
pub async fn serve<A: SyncApi + 'static>(
    daemon: Arc<Daemon<A>>,
    home: PathBuf,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let driver_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = Arc::clone(&daemon);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = render_driver_task(daemon, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let edits_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = Arc::clone(&daemon);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = edit_committer_task(daemon, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = Arc::clone(&daemon);
        let home = home.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(daemon, home, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let poller = daemon.start_sync().await;

    let (driver_result, edits_result, socket_result, signal_result) =
        tokio::join!(driver_handle, edits_handle, socket_handle, signal_handle);

    daemon.sync.stop_polling();
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    daemon.orchestrator.stop().await;
    tracing::info!("daemon stopped");

    handle_join("render_driver", driver_result)?;
    handle_join("edit_committer", edits_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Re-evaluate the render decision on every snapshot replacement or trigger.
async fn render_driver_task<A: SyncApi + 'static>(
    daemon: Arc<Daemon<A>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut files = daemon.sync.subscribe();
    let mut trigger = daemon.trigger.subscribe();

    loop {
        let snapshot = files.borrow_and_update().clone();
        let n = *trigger.borrow_and_update();
        daemon.dispatch(snapshot, n).await;

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            changed = files.changed() => {
                if changed.is_err() {
                    return Err(DaemonError::ChannelClosed("file snapshot"));
                }
            }
            changed = trigger.changed() => {
                if changed.is_err() {
                    return Err(DaemonError::ChannelClosed("run trigger"));
                }
            }
        }
    }
    Ok(())
}

/// Relay committed edits and persist them whenever no render is running.
async fn edit_committer_task<A: SyncApi + 'static>(
    daemon: Arc<Daemon<A>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut committed = daemon
        .committed
        .lock()
        .await
        .take()
        .ok_or(DaemonError::ChannelClosed("edit events"))?;
    let mut status = daemon.orchestrator.watch_status();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = committed.recv() => {
                let Some(event) = event else { break };
                tracing::debug!(edit_event_id = %event.edit_event_id, "edit committed");
                daemon.orchestrator.publish_edit_event(event);
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if let Err(err) = daemon.persist_edits().await {
            tracing::warn!(error = %err, "failed to persist edit events");
        }
    }

    if daemon.debouncer.flush_now().is_some() {
        tracing::debug!("flushed pending edit on shutdown");
    }
    if let Err(err) = daemon.persist_edits().await {
        tracing::warn!(error = %err, "failed to persist edit events on shutdown");
    }
    Ok(())
}

async fn socket_server_task<A: SyncApi + 'static>(
    daemon: Arc<Daemon<A>>,
    home: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let daemon = Arc::clone(&daemon);
                let home = home.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, daemon, home, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client<A: SyncApi + 'static>(
    stream: UnixStream,
    daemon: Arc<Daemon<A>>,
    home: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let shutdown = request.cmd == "shutdown";
        tracing::debug!(cmd = %request.cmd, "control request");
        let response = daemon.handle(request, &home, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if shutdown {
            break;
        }
    }

    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG` controls the filter; defaults to `info`.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = if json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
