//! Error types for runframe-render.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error reported by a worker: message plus optional stack trace.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Coarse class of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Empty file set or unusable entrypoint. Never retried automatically.
    Configuration,
    /// User code failed to compile.
    Compilation,
    /// Worker failed while producing the artifact.
    Render,
}

/// All errors that can end a render run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("no files to render")]
    EmptyFileSet,

    #[error("no entrypoint found; add an index.tsx or set `entrypoint` in the config")]
    NoEntrypoint,

    #[error("entrypoint \"{entrypoint}\" not found in file set")]
    MissingEntrypoint { entrypoint: String },

    #[error("entrypoint \"{entrypoint}\" is empty")]
    EmptyEntrypoint { entrypoint: String },

    #[error("failed to start worker: {0}")]
    Spawn(WorkerError),

    #[error("{0}")]
    Compile(WorkerError),

    #[error("{0}")]
    Render(WorkerError),

    #[error("run cancelled")]
    Cancelled,
}

impl RenderError {
    /// `None` for cancellation, which is never surfaced as a failure.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            RenderError::EmptyFileSet
            | RenderError::NoEntrypoint
            | RenderError::MissingEntrypoint { .. }
            | RenderError::EmptyEntrypoint { .. } => Some(FailureKind::Configuration),
            RenderError::Compile(_) => Some(FailureKind::Compilation),
            RenderError::Spawn(_) | RenderError::Render(_) => Some(FailureKind::Render),
            RenderError::Cancelled => None,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            RenderError::Spawn(err) | RenderError::Compile(err) | RenderError::Render(err) => {
                err.stack.as_deref()
            }
            _ => None,
        }
    }
}
