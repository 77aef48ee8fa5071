//! Edit event debouncer.
//!
//! A gesture is a run of `in_progress = true` events closed by one
//! `in_progress = false` event. Only the terminal event survives, and only
//! after the flush delay passes without a new event arriving.
//!
//! Committed events go two places: the channel returned by
//! [`EditDebouncer::new`] (for live observers) and the batch read by
//! [`EditDebouncer::current_batch`] (for persistence). The persistence side
//! brackets its write with [`mark_batch_started`](EditDebouncer::mark_batch_started)
//! / [`mark_batch_complete`](EditDebouncer::mark_batch_complete) so events
//! committed meanwhile stay queued for the next batch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use runframe_core::EditEvent;

#[derive(Default)]
struct DebounceState {
    pending: Option<EditEvent>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    batch: Vec<EditEvent>,
    in_flight: usize,
}

/// Coalesces edit gestures into single committed events.
///
/// [`push`](Self::push) spawns the flush timer and must be called from within
/// a tokio runtime.
pub struct EditDebouncer {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
    committed: mpsc::UnboundedSender<EditEvent>,
}

impl EditDebouncer {
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<EditEvent>) {
        let (committed, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            delay,
            state: Arc::new(Mutex::new(DebounceState::default())),
            committed,
        };
        (debouncer, rx)
    }

    /// Feed one edit event.
    pub fn push(&self, event: EditEvent) {
        let mut state = lock(&self.state);
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let terminal = !event.in_progress;
        state.pending = Some(event);
        if !terminal {
            return;
        }

        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        let committed = self.committed.clone();
        let delay = self.delay;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flush(&shared, &committed, Some(generation));
        }));
    }

    /// Commit a buffered terminal event immediately (e.g. on shutdown).
    pub fn flush_now(&self) -> Option<EditEvent> {
        flush(&self.state, &self.committed, None)
    }

    /// True while a gesture is buffered and not yet committed.
    pub fn has_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Committed events not yet persisted, oldest first.
    pub fn current_batch(&self) -> Vec<EditEvent> {
        lock(&self.state).batch.clone()
    }

    /// Claim every currently committed event for persistence.
    pub fn mark_batch_started(&self) -> Vec<EditEvent> {
        let mut state = lock(&self.state);
        state.in_flight = state.batch.len();
        state.batch.clone()
    }

    /// Drop the events claimed by the last [`mark_batch_started`](Self::mark_batch_started).
    pub fn mark_batch_complete(&self) {
        let mut state = lock(&self.state);
        let done = state.in_flight.min(state.batch.len());
        state.batch.drain(..done);
        state.in_flight = 0;
    }
}

impl Drop for EditDebouncer {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}

/// Commit the pending terminal event. `generation` guards against a timer
/// that lost the race with a newer event.
fn flush(
    state: &Mutex<DebounceState>,
    committed: &mpsc::UnboundedSender<EditEvent>,
    generation: Option<u64>,
) -> Option<EditEvent> {
    let mut state = lock(state);
    if generation.is_some_and(|g| g != state.generation) {
        return None;
    }
    if state.pending.as_ref().map_or(true, |event| event.in_progress) {
        return None;
    }
    let event = state.pending.take()?;
    if generation.is_none() {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    } else {
        state.timer = None;
    }
    state.batch.push(event.clone());
    let _ = committed.send(event.clone());
    Some(event)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str, in_progress: bool, x: f64) -> EditEvent {
        EditEvent::new(id, in_progress).with_field("new_center", serde_json::json!({ "x": x, "y": 0.0 }))
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn drag_burst_commits_only_the_terminal_event() {
        let (debouncer, mut rx) = EditDebouncer::new(Duration::from_millis(100));

        for i in 0..10 {
            debouncer.push(frame(&format!("drag-{i}"), true, i as f64));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        debouncer.push(frame("drag-end", false, 10.0));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "nothing before the quiet period elapses");

        tokio::time::sleep(Duration::from_millis(100)).await;
        let committed = rx.try_recv().expect("terminal event committed");
        assert_eq!(committed.edit_event_id, "drag-end");
        assert!(rx.try_recv().is_err(), "exactly one emission");
        assert_eq!(debouncer.current_batch().len(), 1);
        assert!(!debouncer.has_pending());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn new_gesture_restarts_the_timer() {
        let (debouncer, mut rx) = EditDebouncer::new(Duration::from_millis(100));

        debouncer.push(frame("first-end", false, 1.0));
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.push(frame("second", true, 2.0));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err(), "in-progress gesture cancels the flush");

        debouncer.push(frame("second-end", false, 3.0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let committed = rx.try_recv().expect("committed");
        assert_eq!(committed.edit_event_id, "second-end");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn batch_markers_keep_late_commits_queued() {
        let (debouncer, mut rx) = EditDebouncer::new(Duration::from_millis(100));

        debouncer.push(frame("a", false, 1.0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        let claimed = debouncer.mark_batch_started();
        assert_eq!(claimed.len(), 1);

        debouncer.push(frame("b", false, 2.0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        debouncer.mark_batch_complete();

        let remaining = debouncer.current_batch();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].edit_event_id, "b");
        assert_eq!(rx.recv().await.map(|e| e.edit_event_id), Some("a".to_string()));
        assert_eq!(rx.recv().await.map(|e| e.edit_event_id), Some("b".to_string()));
    }

    #[tokio::test]
    async fn flush_now_commits_pending_terminal() {
        let (debouncer, mut rx) = EditDebouncer::new(Duration::from_secs(60));
        debouncer.push(frame("end", false, 0.0));
        let flushed = debouncer.flush_now().expect("flushed");
        assert_eq!(flushed.edit_event_id, "end");
        assert_eq!(rx.try_recv().map(|e| e.edit_event_id).ok(), Some("end".to_string()));
        assert!(debouncer.flush_now().is_none());
    }

    #[tokio::test]
    async fn flush_now_ignores_in_progress() {
        let (debouncer, _rx) = EditDebouncer::new(Duration::from_millis(10));
        debouncer.push(frame("mid", true, 0.0));
        assert!(debouncer.flush_now().is_none());
        assert!(debouncer.has_pending());
    }
}
