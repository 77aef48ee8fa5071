//! # runframe-render
//!
//! Drives an isolated circuit worker through compile, render and settle,
//! one run at a time.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use runframe_core::FileSnapshot;
//! use runframe_render::{
//!     OrchestratorOptions, ProcessWorkerFactory, RenderOrchestrator, RunInput, WorkerPool,
//! };
//!
//! async fn render_once(files: FileSnapshot) {
//!     let factory = ProcessWorkerFactory::new(vec!["node".into(), "worker.js".into()]);
//!     let pool = Arc::new(WorkerPool::new(Arc::new(factory), None));
//!     let orchestrator = RenderOrchestrator::new(pool, OrchestratorOptions::default());
//!     let input = RunInput {
//!         snapshot: files,
//!         entrypoint: Some("index.tsx".into()),
//!         trigger: 0,
//!     };
//!     if let Some(outcome) = orchestrator.evaluate(input).await {
//!         println!("{outcome:?}");
//!     }
//! }
//! ```

pub mod error;
pub mod mutex;
pub mod orchestrator;
pub mod pool;
pub mod process;
pub mod progress;
pub mod session;
pub mod worker;

pub use error::{FailureKind, RenderError, WorkerError};
pub use mutex::{Completion, ExecutionMutex};
pub use orchestrator::{OrchestratorOptions, RenderOrchestrator, RunInput, RunReason};
pub use pool::{WorkerHandle, WorkerPool};
pub use process::{ProcessWorker, ProcessWorkerFactory};
pub use progress::{ProgressEstimator, PHASES_PER_RENDER};
pub use session::{
    PhaseTiming, RenderFailure, RenderPhase, RenderSession, RenderStatus, RenderUpdate,
    RunOutcome, RunState,
};
pub use worker::{CircuitWorker, LifecycleEvent, WorkerFactory};
