//! Owns the cached worker handle.
//!
//! The worker is constructed lazily on first use and reused until it is
//! invalidated by [`WorkerPool::invalidate`] (stop) or an engine version change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::WorkerError;
use crate::worker::{CircuitWorker, WorkerFactory};

/// A live worker plus the pool generation that produced it.
#[derive(Clone)]
pub struct WorkerHandle {
    pub generation: u64,
    pub worker: Arc<dyn CircuitWorker>,
}

#[derive(Default)]
struct Slot {
    handle: Option<WorkerHandle>,
    engine_version: Option<String>,
}

pub struct WorkerPool {
    factory: Arc<dyn WorkerFactory>,
    slot: Mutex<Slot>,
    spawned: AtomicU64,
}

impl WorkerPool {
    pub fn new(factory: Arc<dyn WorkerFactory>, engine_version: Option<String>) -> Self {
        Self {
            factory,
            slot: Mutex::new(Slot {
                handle: None,
                engine_version,
            }),
            spawned: AtomicU64::new(0),
        }
    }

    /// Return the cached worker, spawning one if none is live.
    pub async fn acquire(&self) -> Result<WorkerHandle, WorkerError> {
        let mut slot = self.slot.lock().await;
        if let Some(handle) = &slot.handle {
            return Ok(handle.clone());
        }

        let worker = self.factory.spawn(slot.engine_version.as_deref()).await?;
        let generation = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            generation,
            engine_version = slot.engine_version.as_deref().unwrap_or("default"),
            "spawned worker"
        );
        let handle = WorkerHandle { generation, worker };
        slot.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Kill and drop the cached worker. The next [`acquire`](Self::acquire)
    /// spawns a fresh one.
    pub async fn invalidate(&self) {
        let handle = self.slot.lock().await.handle.take();
        if let Some(handle) = handle {
            tracing::info!(generation = handle.generation, "killing worker");
            handle.worker.kill().await;
        }
    }

    /// Changing the engine version invalidates the cached worker.
    pub async fn set_engine_version(&self, version: Option<String>) {
        let stale = {
            let mut slot = self.slot.lock().await;
            if slot.engine_version == version {
                return;
            }
            tracing::info!(
                from = slot.engine_version.as_deref().unwrap_or("default"),
                to = version.as_deref().unwrap_or("default"),
                "engine version changed"
            );
            slot.engine_version = version;
            slot.handle.take()
        };
        if let Some(handle) = stale {
            handle.worker.kill().await;
        }
    }

    pub async fn engine_version(&self) -> Option<String> {
        self.slot.lock().await.engine_version.clone()
    }

    pub async fn is_live(&self) -> bool {
        self.slot.lock().await.handle.is_some()
    }

    /// Number of workers spawned over the pool's lifetime.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }
}
