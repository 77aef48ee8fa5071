//! Render orchestrator.
//!
//! Decides whether a new input warrants a run, serializes runs through the
//! [`ExecutionMutex`], drives the worker through compile, initial render,
//! settle and final artifact, and broadcasts [`RenderUpdate`]s.
//!
//! A run is dispatched when any of these hold:
//!
//! 1. first observation of a non-empty file set,
//! 2. the file set differs from the last dispatched one,
//! 3. the entrypoint differs from the last dispatched one,
//! 4. manual-run mode is on and the trigger counter moved.
//!
//! A dispatch that arrives while a run is executing cancels it and kills the
//! worker. Queued runs that a newer dispatch superseded are skipped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use runframe_core::{diff, Artifact, Config, EditEvent, FileSnapshot, RunId};

use crate::error::{RenderError, WorkerError};
use crate::mutex::{Completion, ExecutionMutex};
use crate::pool::WorkerPool;
use crate::progress::{ProgressEstimator, PHASES_PER_RENDER};
use crate::session::{
    RenderFailure, RenderPhase, RenderSession, RenderStatus, RenderUpdate, RunOutcome, RunState,
};
use crate::worker::LifecycleEvent;

/// Prefix the worker puts in front of compile errors. Stripped up to the
/// closing `": "` of the quoted file name.
const COMPILE_ERROR_PREFIX: &str = "Eval compiled js error for ";

const UPDATE_BUFFER: usize = 256;

/// Minimum progress step worth publishing.
const PROGRESS_STEP: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Also run whenever the manual trigger counter changes.
    pub manual_run: bool,
    pub phases_per_render: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            manual_run: false,
            phases_per_render: PHASES_PER_RENDER,
        }
    }
}

impl From<&Config> for OrchestratorOptions {
    fn from(config: &Config) -> Self {
        Self {
            manual_run: config.manual_run,
            ..Self::default()
        }
    }
}

/// One observation of the inputs a run depends on.
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub snapshot: FileSnapshot,
    pub entrypoint: Option<String>,
    /// Manual trigger counter.
    pub trigger: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    InitialLoad,
    FilesChanged(Vec<String>),
    EntrypointChanged {
        from: Option<String>,
        to: Option<String>,
    },
    ManualTrigger(u64),
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunReason::InitialLoad => f.write_str("initial load"),
            RunReason::FilesChanged(paths) => write!(f, "{} file(s) changed", paths.len()),
            RunReason::EntrypointChanged { from, to } => write!(
                f,
                "entrypoint changed from {} to {}",
                from.as_deref().unwrap_or("none"),
                to.as_deref().unwrap_or("none")
            ),
            RunReason::ManualTrigger(n) => write!(f, "manual trigger #{n}"),
        }
    }
}

#[derive(Debug, Default)]
struct DecisionState {
    seen_files: bool,
    last_snapshot: FileSnapshot,
    last_entrypoint: Option<String>,
    last_trigger: u64,
}

impl DecisionState {
    fn decide(&mut self, input: &RunInput, manual_run: bool) -> Option<RunReason> {
        let trigger_moved = input.trigger != self.last_trigger;
        self.last_trigger = input.trigger;

        let reason = if !self.seen_files && !input.snapshot.is_empty() {
            Some(RunReason::InitialLoad)
        } else if self.seen_files {
            let changes = diff(&self.last_snapshot, &input.snapshot);
            if !changes.is_empty() {
                for change in changes.summary() {
                    tracing::debug!(
                        path = %change.path,
                        kind = ?change.kind,
                        inserted = change.inserted,
                        deleted = change.deleted,
                        "file changed"
                    );
                }
                Some(RunReason::FilesChanged(
                    changes.paths().map(str::to_string).collect(),
                ))
            } else if input.entrypoint != self.last_entrypoint {
                Some(RunReason::EntrypointChanged {
                    from: self.last_entrypoint.clone(),
                    to: input.entrypoint.clone(),
                })
            } else {
                None
            }
        } else {
            None
        };

        let reason = reason.or_else(|| {
            (manual_run && trigger_moved).then_some(RunReason::ManualTrigger(input.trigger))
        })?;

        self.seen_files |= !input.snapshot.is_empty();
        self.last_snapshot = input.snapshot.clone();
        self.last_entrypoint = input.entrypoint.clone();
        Some(reason)
    }
}

pub struct RenderOrchestrator {
    pool: Arc<WorkerPool>,
    mutex: ExecutionMutex,
    options: OrchestratorOptions,
    decisions: Mutex<DecisionState>,
    next_run: AtomicU64,
    latest_run: AtomicU64,
    status: Arc<watch::Sender<RenderStatus>>,
    updates: broadcast::Sender<RenderUpdate>,
}

impl RenderOrchestrator {
    pub fn new(pool: Arc<WorkerPool>, options: OrchestratorOptions) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            pool,
            mutex: ExecutionMutex::new(),
            options,
            decisions: Mutex::new(DecisionState::default()),
            next_run: AtomicU64::new(0),
            latest_run: AtomicU64::new(0),
            status: Arc::new(watch::Sender::new(RenderStatus::default())),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RenderUpdate> {
        self.updates.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<RenderStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> RenderStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().running
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Relay a committed edit event to subscribers.
    pub fn publish_edit_event(&self, event: EditEvent) {
        self.publish(RenderUpdate::EditEvent { event });
    }

    /// Decide on `input` and, if warranted, run to completion.
    pub async fn evaluate(&self, input: RunInput) -> Option<RunOutcome> {
        let (run_id, reason) = self.dispatch(&input).await?;
        Some(self.run(run_id, reason, input).await)
    }

    /// Decide on `input` and, if warranted, run on a background task.
    pub async fn submit(self: &Arc<Self>, input: RunInput) -> Option<JoinHandle<RunOutcome>> {
        let (run_id, reason) = self.dispatch(&input).await?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.run(run_id, reason, input).await }))
    }

    /// Cancel the current run and drop the worker; the next run spawns a
    /// fresh one.
    pub async fn stop(&self) {
        let cancelled = self.mutex.cancel_current();
        self.pool.invalidate().await;
        self.status.send_modify(|status| {
            status.running = false;
            status.active_run = None;
            if cancelled {
                status.state = RunState::Cancelled;
            }
        });
        tracing::info!(cancelled, "render stopped");
    }

    async fn dispatch(&self, input: &RunInput) -> Option<(RunId, RunReason)> {
        let reason = lock(&self.decisions).decide(input, self.options.manual_run)?;
        let run_id = RunId(self.next_run.fetch_add(1, Ordering::SeqCst) + 1);
        self.latest_run.store(run_id.0, Ordering::SeqCst);
        tracing::info!(
            run = %run_id,
            reason = %reason,
            files = input.snapshot.len(),
            "dispatching render"
        );

        if self.mutex.cancel_current() {
            tracing::info!(run = %run_id, "preempting running render");
            self.pool.invalidate().await;
        }
        self.status.send_modify(|status| {
            status.state = RunState::Armed;
            status.runs_dispatched += 1;
        });
        Some((run_id, reason))
    }

    async fn run(&self, run_id: RunId, reason: RunReason, input: RunInput) -> RunOutcome {
        self.publish(RenderUpdate::Started { run_id });

        let outcome = match validate(&input) {
            Err(err) => Err(err),
            Ok(entrypoint) => {
                let session = RenderSession::new(run_id, entrypoint, input.snapshot);
                self.mutex
                    .run_exclusively(|token| self.execute(session, token))
                    .await
            }
        };

        let outcome = match outcome {
            Ok(Completion::Finished(artifact)) => RunOutcome::Succeeded(artifact),
            Ok(Completion::Cancelled) | Err(RenderError::Cancelled) => RunOutcome::Cancelled,
            Err(err) => match RenderFailure::from_error(&err) {
                Some(failure) => RunOutcome::Failed(failure),
                None => RunOutcome::Cancelled,
            },
        };
        self.finish(run_id, &reason, &outcome);
        outcome
    }

    async fn execute(
        &self,
        mut session: RenderSession,
        token: CancellationToken,
    ) -> Result<Artifact, RenderError> {
        let run_id = session.run_id;
        if self.latest_run.load(Ordering::SeqCst) != run_id.0 {
            tracing::debug!(run = %run_id, "skipping superseded render");
            return Err(RenderError::Cancelled);
        }
        self.status.send_modify(|status| {
            status.state = RunState::Running;
            status.running = true;
            status.active_run = Some(run_id);
            status.entrypoint = Some(session.entrypoint.clone());
            status.progress = 0.0;
            status.phase_timings.clear();
        });
        self.publish(RenderUpdate::Progress {
            run_id,
            progress: 0.0,
        });

        let result = self.drive(&mut session, &token).await;

        let timings = session.phase_timings().to_vec();
        self.status.send_modify(|status| {
            if status.active_run == Some(run_id) {
                status.phase_timings = timings;
            }
        });
        if let Err(RenderError::Render(_) | RenderError::Spawn(_)) = &result {
            if !token.is_cancelled() {
                self.pool.invalidate().await;
            }
        }
        tracing::debug!(
            run = %run_id,
            elapsed_ms = session.elapsed_millis(),
            ok = result.is_ok(),
            "render body finished"
        );
        result
    }

    async fn drive(
        &self,
        session: &mut RenderSession,
        token: &CancellationToken,
    ) -> Result<Artifact, RenderError> {
        let run_id = session.run_id;

        let since = Instant::now();
        let handle = self.pool.acquire().await.map_err(RenderError::Spawn)?;
        session.record(RenderPhase::AcquireWorker, since);
        checkpoint(token)?;
        let worker = handle.worker;

        let estimator = Arc::new(Mutex::new(ProgressEstimator::new(
            self.options.phases_per_render,
        )));
        let _progress = AbortOnDrop(tokio::spawn(track_progress(
            worker.lifecycle_events(),
            Arc::clone(&estimator),
            self.updates.clone(),
            Arc::clone(&self.status),
            run_id,
            token.clone(),
        )));

        let since = Instant::now();
        worker
            .execute_with_fs_map(&session.entrypoint, &session.snapshot)
            .await
            .map_err(|err| RenderError::Compile(strip_compile_prefix(err)))?;
        session.record(RenderPhase::Compile, since);
        checkpoint(token)?;

        let since = Instant::now();
        let (settled, initial) = tokio::join!(worker.render_until_settled(), async {
            let artifact = worker.get_circuit_json().await;
            if let Ok(artifact) = &artifact {
                if !token.is_cancelled() {
                    self.publish(RenderUpdate::InitialRender {
                        run_id,
                        artifact: artifact.clone(),
                    });
                }
            }
            artifact
        });
        initial.map_err(RenderError::Render)?;
        session.record(RenderPhase::InitialRender, since);
        settled.map_err(RenderError::Render)?;
        session.record(RenderPhase::Settle, since);
        checkpoint(token)?;

        let since = Instant::now();
        let artifact = worker.get_circuit_json().await.map_err(RenderError::Render)?;
        session.record(RenderPhase::FinalArtifact, since);
        checkpoint(token)?;

        let progress = {
            let mut estimator = lock(&estimator);
            tracing::debug!(
                run = %run_id,
                renders = estimator.render_count(),
                events = estimator.event_count(),
                "progress settled"
            );
            estimator.finish()
        };
        self.status.send_modify(|status| status.progress = progress);
        self.publish(RenderUpdate::Progress { run_id, progress });
        self.publish(RenderUpdate::Finished {
            run_id,
            artifact: artifact.clone(),
        });
        Ok(artifact)
    }

    fn finish(&self, run_id: RunId, reason: &RunReason, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Succeeded(artifact) => {
                tracing::info!(run = %run_id, reason = %reason, elements = artifact.len(), "render finished");
            }
            RunOutcome::Failed(failure) => {
                tracing::warn!(run = %run_id, kind = ?failure.kind, error = %failure.message, "render failed");
                self.publish(RenderUpdate::Error {
                    run_id,
                    error: failure.clone(),
                });
            }
            RunOutcome::Cancelled => {
                tracing::info!(run = %run_id, "render cancelled");
                self.publish(RenderUpdate::Cancelled { run_id });
            }
        }

        self.status.send_modify(|status| {
            // A newer run may already own the status.
            let owns_status = status.active_run.map_or(true, |active| active == run_id);
            status.last_run = Some(run_id);
            match outcome {
                RunOutcome::Succeeded(artifact) => {
                    status.last_error = None;
                    status.last_artifact_elements = Some(artifact.len());
                }
                RunOutcome::Failed(failure) => status.last_error = Some(failure.clone()),
                RunOutcome::Cancelled => {}
            }
            if owns_status {
                status.running = false;
                status.active_run = None;
                status.state = match outcome {
                    RunOutcome::Succeeded(_) => RunState::Settled,
                    RunOutcome::Failed(_) => RunState::Errored,
                    RunOutcome::Cancelled => RunState::Cancelled,
                };
            }
        });
    }

    fn publish(&self, update: RenderUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}

fn validate(input: &RunInput) -> Result<String, RenderError> {
    if input.snapshot.is_empty() {
        return Err(RenderError::EmptyFileSet);
    }
    let entrypoint = input.entrypoint.clone().ok_or(RenderError::NoEntrypoint)?;
    match input.snapshot.get(&entrypoint) {
        None => Err(RenderError::MissingEntrypoint { entrypoint }),
        Some(content) if content.trim().is_empty() => {
            Err(RenderError::EmptyEntrypoint { entrypoint })
        }
        Some(_) => Ok(entrypoint),
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), RenderError> {
    if token.is_cancelled() {
        Err(RenderError::Cancelled)
    } else {
        Ok(())
    }
}

fn strip_compile_prefix(mut err: WorkerError) -> WorkerError {
    let detail = err
        .message
        .strip_prefix(COMPILE_ERROR_PREFIX)
        .and_then(|rest| rest.split_once("\": "))
        .map(|(_, detail)| detail.to_string());
    if let Some(detail) = detail {
        err.message = detail;
    }
    err
}

async fn track_progress(
    mut events: broadcast::Receiver<LifecycleEvent>,
    estimator: Arc<Mutex<ProgressEstimator>>,
    updates: broadcast::Sender<RenderUpdate>,
    status: Arc<watch::Sender<RenderStatus>>,
    run_id: RunId,
    token: CancellationToken,
) {
    let mut published = 0.0;
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(run = %run_id, skipped, "progress tracker lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let progress = lock(&estimator).observe(&event);
        if progress - published >= PROGRESS_STEP {
            published = progress;
            status.send_modify(|status| status.progress = progress);
            let _ = updates.send(RenderUpdate::Progress { run_id, progress });
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
