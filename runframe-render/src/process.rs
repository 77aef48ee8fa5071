//! Worker backed by a child process speaking newline-delimited JSON.
//!
//! Requests written to the child's stdin:
//!
//! ```text
//! {"id": 1, "method": "execute_with_fs_map", "params": {"entrypoint": "index.tsx", "fs_map": {...}}}
//! ```
//!
//! Lines read from its stdout are either a response to a request,
//! `{"id": 1, "result": ...}` / `{"id": 1, "error": {"message": ..., "stack": ...}}`,
//! or an unsolicited lifecycle event, `{"event": {"render_id": ..., "event_name": ...}}`.
//! When the child exits every pending request fails.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use runframe_core::{Artifact, FileSnapshot};

use crate::error::WorkerError;
use crate::worker::{CircuitWorker, LifecycleEvent, WorkerFactory};

/// Env var through which the engine version reaches the child.
pub const ENGINE_VERSION_ENV: &str = "RUNFRAME_ENGINE_VERSION";

const EVENT_BUFFER: usize = 1024;

type Reply = Result<Value, WorkerError>;

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkerMessage {
    Event {
        event: LifecycleEvent,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<WorkerError>,
    },
}

#[derive(Default)]
struct Pending {
    waiting: HashMap<u64, oneshot::Sender<Reply>>,
    exited: bool,
}

pub struct ProcessWorker {
    program: String,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    events: broadcast::Sender<LifecycleEvent>,
    reader: JoinHandle<()>,
}

impl ProcessWorker {
    /// Spawn `command` (program followed by its arguments).
    pub fn spawn(command: &[String], engine_version: Option<&str>) -> Result<Self, WorkerError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| WorkerError::new("worker command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(version) = engine_version {
            cmd.env(ENGINE_VERSION_ENV, version);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::new(format!("failed to spawn `{program}`: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::new("failed to capture worker stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::new("failed to capture worker stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(program.clone(), stderr));
        }

        let pending = Arc::new(Mutex::new(Pending::default()));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_stdout(
            program.clone(),
            stdout,
            Arc::clone(&pending),
            events.clone(),
        ));

        tracing::debug!(program = %program, pid = child.id(), "worker process started");
        Ok(Self {
            program: program.clone(),
            child: tokio::sync::Mutex::new(Some(child)),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(0),
            events,
            reader,
        })
    }

    async fn request(&self, method: &str, params: Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.exited {
                return Err(exited(&self.program));
            }
            pending.waiting.insert(id, tx);
        }

        let mut line = serde_json::to_string(&Request { id, method, params })
            .map_err(|e| WorkerError::new(format!("failed to encode {method} request: {e}")))?;
        line.push('\n');

        if let Err(err) = self.write_line(&line).await {
            lock(&self.pending).waiting.remove(&id);
            return Err(err);
        }
        rx.await.unwrap_or_else(|_| Err(exited(&self.program)))
    }

    async fn write_line(&self, line: &str) -> Result<(), WorkerError> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or_else(|| exited(&self.program))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WorkerError::new(format!("failed to write to worker: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| WorkerError::new(format!("failed to write to worker: {e}")))
    }
}

#[async_trait]
impl CircuitWorker for ProcessWorker {
    async fn execute_with_fs_map(
        &self,
        entrypoint: &str,
        files: &FileSnapshot,
    ) -> Result<(), WorkerError> {
        self.request(
            "execute_with_fs_map",
            json!({ "entrypoint": entrypoint, "fs_map": files }),
        )
        .await
        .map(drop)
    }

    async fn get_circuit_json(&self) -> Result<Artifact, WorkerError> {
        let value = self.request("get_circuit_json", Value::Null).await?;
        serde_json::from_value(value)
            .map_err(|e| WorkerError::new(format!("worker returned malformed circuit json: {e}")))
    }

    async fn render_until_settled(&self) -> Result<(), WorkerError> {
        self.request("render_until_settled", Value::Null)
            .await
            .map(drop)
    }

    fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    async fn kill(&self) {
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                tracing::warn!(program = %self.program, error = %err, "failed to kill worker");
            }
        }
        self.reader.abort();
        fail_pending(&self.pending, &self.program);
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Spawns a [`ProcessWorker`] running a fixed command.
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    command: Vec<String>,
}

impl ProcessWorkerFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(
        &self,
        engine_version: Option<&str>,
    ) -> Result<Arc<dyn CircuitWorker>, WorkerError> {
        let worker = ProcessWorker::spawn(&self.command, engine_version)?;
        Ok(Arc::new(worker))
    }
}

async fn read_stdout<R>(
    program: String,
    stdout: R,
    pending: Arc<Mutex<Pending>>,
    events: broadcast::Sender<LifecycleEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(program = %program, error = %err, "failed to read worker output");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Event { event }) => {
                // No subscribers between runs.
                let _ = events.send(event);
            }
            Ok(WorkerMessage::Response { id, result, error }) => {
                let reply = match error {
                    Some(error) => Err(error),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                match lock(&pending).waiting.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => tracing::debug!(program = %program, id, "response for unknown request"),
                }
            }
            Err(err) => {
                tracing::debug!(program = %program, error = %err, line = %line, "ignoring worker output");
            }
        }
    }

    tracing::info!(program = %program, "worker process exited");
    fail_pending(&pending, &program);
}

async fn forward_stderr<R>(program: String, stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(program = %program, "{line}");
    }
}

fn fail_pending(pending: &Mutex<Pending>, program: &str) {
    let waiting = {
        let mut pending = lock(pending);
        pending.exited = true;
        std::mem::take(&mut pending.waiting)
    };
    for (_, tx) in waiting {
        let _ = tx.send(Err(exited(program)));
    }
}

fn exited(program: &str) -> WorkerError {
    WorkerError::new(format!("worker `{program}` exited"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
