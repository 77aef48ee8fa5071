//! The worker surface the orchestrator drives.
//!
//! A worker is an isolated evaluation context (in production a child process,
//! see [`crate::process`]) that compiles a file set, renders it until the
//! board settles, and returns the circuit artifact.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use runframe_core::{Artifact, FileSnapshot};

use crate::error::WorkerError;

/// One lifecycle notification emitted by the worker while rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub render_id: String,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

#[async_trait]
pub trait CircuitWorker: Send + Sync {
    /// Load `files` and evaluate `entrypoint`. Errors here are compile errors.
    async fn execute_with_fs_map(
        &self,
        entrypoint: &str,
        files: &FileSnapshot,
    ) -> Result<(), WorkerError>;

    /// The artifact as currently rendered.
    async fn get_circuit_json(&self) -> Result<Artifact, WorkerError>;

    /// Resolves once no more async work is pending inside the worker.
    async fn render_until_settled(&self) -> Result<(), WorkerError>;

    /// A fresh receiver for lifecycle events; only events sent after the call
    /// are observed.
    fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent>;

    /// Terminate the worker. Idempotent.
    async fn kill(&self);
}

/// Builds workers on demand for [`crate::WorkerPool`].
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn spawn(
        &self,
        engine_version: Option<&str>,
    ) -> Result<Arc<dyn CircuitWorker>, WorkerError>;
}
