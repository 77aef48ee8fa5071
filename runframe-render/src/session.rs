//! Per-run state and the values the orchestrator publishes.

use std::time::Instant;

use serde::Serialize;

use runframe_core::{Artifact, EditEvent, FileSnapshot, RunId};

use crate::error::{FailureKind, RenderError};

/// Terminal result of one dispatched run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded(Artifact),
    Failed(RenderFailure),
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded(_))
    }

    pub fn failure(&self) -> Option<&RenderFailure> {
        match self {
            RunOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Error state surfaced for a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RenderFailure {
    /// `None` for cancellation.
    pub fn from_error(err: &RenderError) -> Option<Self> {
        Some(Self {
            kind: err.kind()?,
            message: err.to_string(),
            stack: err.stack().map(str::to_string),
        })
    }
}

/// Everything the orchestrator broadcasts to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderUpdate {
    Started { run_id: RunId },
    Progress { run_id: RunId, progress: f64 },
    InitialRender { run_id: RunId, artifact: Artifact },
    Finished { run_id: RunId, artifact: Artifact },
    Error { run_id: RunId, error: RenderFailure },
    Cancelled { run_id: RunId },
    EditEvent { event: EditEvent },
}

impl RenderUpdate {
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            RenderUpdate::Started { run_id }
            | RenderUpdate::Progress { run_id, .. }
            | RenderUpdate::InitialRender { run_id, .. }
            | RenderUpdate::Finished { run_id, .. }
            | RenderUpdate::Error { run_id, .. }
            | RenderUpdate::Cancelled { run_id } => Some(*run_id),
            RenderUpdate::EditEvent { .. } => None,
        }
    }
}

/// Orchestrator lifecycle: `Idle -> Armed -> Running -> Settled | Errored | Cancelled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    /// A run was dispatched and waits for the execution mutex.
    Armed,
    Running,
    Settled,
    Errored,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPhase {
    AcquireWorker,
    Compile,
    InitialRender,
    Settle,
    FinalArtifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    pub phase: RenderPhase,
    pub millis: u64,
}

/// Snapshot of orchestrator state for status queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderStatus {
    pub state: RunState,
    pub running: bool,
    pub active_run: Option<RunId>,
    pub entrypoint: Option<String>,
    pub progress: f64,
    pub runs_dispatched: u64,
    pub last_run: Option<RunId>,
    pub last_error: Option<RenderFailure>,
    pub last_artifact_elements: Option<usize>,
    pub phase_timings: Vec<PhaseTiming>,
}

/// Transient state for one execution attempt.
#[derive(Debug)]
pub struct RenderSession {
    pub run_id: RunId,
    pub entrypoint: String,
    pub snapshot: FileSnapshot,
    started: Instant,
    phase_timings: Vec<PhaseTiming>,
}

impl RenderSession {
    pub fn new(run_id: RunId, entrypoint: String, snapshot: FileSnapshot) -> Self {
        Self {
            run_id,
            entrypoint,
            snapshot,
            started: Instant::now(),
            phase_timings: Vec::new(),
        }
    }

    /// Record that `phase` ran from `since` until now.
    pub fn record(&mut self, phase: RenderPhase, since: Instant) {
        let millis = u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(run = %self.run_id, ?phase, millis, "render phase finished");
        self.phase_timings.push(PhaseTiming { phase, millis });
    }

    pub fn phase_timings(&self) -> &[PhaseTiming] {
        &self.phase_timings
    }

    pub fn elapsed_millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
