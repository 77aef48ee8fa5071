//! Execution mutex with cooperative cancellation.
//!
//! Every call to [`ExecutionMutex::run_exclusively`] appends a link to a
//! chain: it waits for the previous link to be released, runs, then releases
//! its own link from a drop guard, so success, error, panic and a dropped
//! future all release. Tasks run in submission order.
//!
//! [`ExecutionMutex::cancel_current`] cancels the running task's token. A
//! waiter treats a cancelled predecessor as released, so a cancelled task
//! that keeps running never blocks the tasks behind it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Result of a task run under the mutex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    Finished(T),
    /// The task was cancelled and failed; its error is swallowed.
    Cancelled,
}

struct Link {
    released: oneshot::Receiver<()>,
    token: CancellationToken,
}

impl Link {
    async fn wait(&mut self) {
        tokio::select! {
            _ = &mut self.released => {}
            _ = self.token.cancelled() => {}
        }
    }
}

struct Holder {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct MutexState {
    tail: Option<Link>,
    current: Option<Holder>,
    next_id: u64,
}

/// Serializes async tasks; at most one non-cancelled task body runs at a time.
#[derive(Clone, Default)]
pub struct ExecutionMutex {
    state: Arc<Mutex<MutexState>>,
}

impl ExecutionMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once every previously submitted task has released.
    ///
    /// `task` receives the token that [`cancel_current`](Self::cancel_current)
    /// trips; it should check it at each suspension point.
    pub async fn run_exclusively<T, E, F, Fut>(&self, task: F) -> Result<Completion<T>, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = CancellationToken::new();
        let (release, released) = oneshot::channel();
        let (id, previous) = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let previous = state.tail.replace(Link {
                released,
                token: token.clone(),
            });
            (state.next_id, previous)
        };

        let mut guard = ReleaseGuard {
            state: Arc::clone(&self.state),
            id,
            release: Some(release),
            waiting_on: previous,
        };
        if let Some(previous) = guard.waiting_on.as_mut() {
            previous.wait().await;
        }
        guard.waiting_on = None;

        lock(&self.state).current = Some(Holder {
            id,
            token: token.clone(),
        });

        match task(token.clone()).await {
            Ok(value) => Ok(Completion::Finished(value)),
            Err(_) if token.is_cancelled() => {
                tracing::debug!(task = id, "swallowing error from cancelled task");
                Ok(Completion::Cancelled)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel the running task and release the lock for new callers.
    ///
    /// Returns `false` when nothing was running.
    pub fn cancel_current(&self) -> bool {
        let mut state = lock(&self.state);
        match state.current.take() {
            Some(holder) => {
                holder.token.cancel();
                tracing::debug!(task = holder.id, "cancelled running task");
                true
            }
            None => false,
        }
    }

    /// True while a non-cancelled task body is running.
    pub fn is_locked(&self) -> bool {
        lock(&self.state).current.is_some()
    }
}

struct ReleaseGuard {
    state: Arc<Mutex<MutexState>>,
    id: u64,
    release: Option<oneshot::Sender<()>>,
    waiting_on: Option<Link>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.state);
            if state.current.as_ref().is_some_and(|holder| holder.id == self.id) {
                state.current = None;
            }
        }

        let Some(release) = self.release.take() else {
            return;
        };
        match (self.waiting_on.take(), tokio::runtime::Handle::try_current()) {
            // Dropped while still queued: hand our place to the predecessor so
            // whoever waits on us keeps waiting for it.
            (Some(mut previous), Ok(handle)) => {
                handle.spawn(async move {
                    previous.wait().await;
                    let _ = release.send(());
                });
            }
            _ => {
                let _ = release.send(());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
