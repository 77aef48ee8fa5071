//! Render orchestrator against a scripted in-process worker.
//!
//! The fake worker's behaviour is driven by the entrypoint content:
//! `syntax error` fails compilation, `explode` fails rendering and `slow`
//! blocks settlement until the factory's gate opens or the worker is killed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use runframe_core::{Artifact, FileSnapshot};
use runframe_render::{
    CircuitWorker, FailureKind, LifecycleEvent, OrchestratorOptions, RenderOrchestrator,
    RenderUpdate, RunInput, RunOutcome, RunState, WorkerError, WorkerFactory, WorkerPool,
};

const LIFECYCLE_EVENTS: usize = 500;

struct FakeWorker {
    files: Mutex<(String, FileSnapshot)>,
    events: broadcast::Sender<LifecycleEvent>,
    artifact_calls: AtomicUsize,
    killed: CancellationToken,
    gate: CancellationToken,
    kill_count: AtomicUsize,
}

impl FakeWorker {
    fn new(gate: CancellationToken) -> Self {
        Self {
            files: Mutex::new((String::new(), FileSnapshot::new())),
            events: broadcast::channel(1024).0,
            artifact_calls: AtomicUsize::new(0),
            killed: CancellationToken::new(),
            gate,
            kill_count: AtomicUsize::new(0),
        }
    }

    fn entry_content(&self) -> String {
        let files = self.files.lock().unwrap();
        files.1.get(&files.0).unwrap_or_default().to_string()
    }
}

#[async_trait]
impl CircuitWorker for FakeWorker {
    async fn execute_with_fs_map(
        &self,
        entrypoint: &str,
        files: &FileSnapshot,
    ) -> Result<(), WorkerError> {
        if self.killed.is_cancelled() {
            return Err(WorkerError::new("worker killed"));
        }
        *self.files.lock().unwrap() = (entrypoint.to_string(), files.clone());
        if self.entry_content().contains("syntax error") {
            return Err(WorkerError::new(format!(
                "Eval compiled js error for \"./{entrypoint}\": Unexpected token (1:7)"
            ))
            .with_stack("SyntaxError: Unexpected token\n    at index.tsx:1:7"));
        }
        Ok(())
    }

    async fn get_circuit_json(&self) -> Result<Artifact, WorkerError> {
        if self.killed.is_cancelled() {
            return Err(WorkerError::new("worker killed"));
        }
        let call = self.artifact_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let elements = (0..call)
            .map(|i| json!({ "type": "source_component", "name": format!("R{i}") }))
            .collect();
        Ok(Artifact(elements))
    }

    async fn render_until_settled(&self) -> Result<(), WorkerError> {
        for i in 0..LIFECYCLE_EVENTS {
            let _ = self.events.send(LifecycleEvent {
                render_id: format!("render-{}", i % 5),
                event_name: "renderable:renderLifecycle:PcbTraceRender:end".to_string(),
                component: None,
            });
        }
        tokio::task::yield_now().await;

        let content = self.entry_content();
        if content.contains("explode") {
            return Err(WorkerError::new("Cannot read properties of undefined").with_stack("at render"));
        }
        if content.contains("slow") {
            tokio::select! {
                _ = self.gate.cancelled() => {}
                _ = self.killed.cancelled() => return Err(WorkerError::new("worker killed")),
            }
        }
        Ok(())
    }

    fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    async fn kill(&self) {
        self.kill_count.fetch_add(1, Ordering::SeqCst);
        self.killed.cancel();
    }
}

#[derive(Default)]
struct FakeFactory {
    gate: CancellationToken,
    workers: Mutex<Vec<Arc<FakeWorker>>>,
    broken: AtomicBool,
}

impl FakeFactory {
    fn spawned(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    fn worker(&self, n: usize) -> Arc<FakeWorker> {
        Arc::clone(&self.workers.lock().unwrap()[n])
    }
}

#[async_trait]
impl WorkerFactory for FakeFactory {
    async fn spawn(
        &self,
        _engine_version: Option<&str>,
    ) -> Result<Arc<dyn CircuitWorker>, WorkerError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(WorkerError::new("node: command not found"));
        }
        let worker = Arc::new(FakeWorker::new(self.gate.clone()));
        self.workers.lock().unwrap().push(Arc::clone(&worker));
        Ok(worker)
    }
}

fn setup(options: OrchestratorOptions) -> (Arc<FakeFactory>, Arc<RenderOrchestrator>) {
    let factory = Arc::new(FakeFactory::default());
    let pool = Arc::new(WorkerPool::new(factory.clone(), None));
    (factory, Arc::new(RenderOrchestrator::new(pool, options)))
}

fn input(files: &[(&str, &str)], trigger: u64) -> RunInput {
    RunInput {
        snapshot: files.iter().copied().collect(),
        entrypoint: Some("index.tsx".to_string()),
        trigger,
    }
}

fn drain(rx: &mut broadcast::Receiver<RenderUpdate>) -> Vec<RenderUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

async fn wait_until_running(orchestrator: &RenderOrchestrator) {
    let mut status = orchestrator.watch_status();
    status
        .wait_for(|status| status.running)
        .await
        .expect("status sender alive");
}

#[tokio::test]
async fn initial_load_runs_once_and_idle_polls_do_not() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());

    assert!(orchestrator.evaluate(input(&[], 0)).await.is_none(), "nothing loaded yet");

    let files = [("index.tsx", "<board width=\"10mm\"/>")];
    let outcome = orchestrator.evaluate(input(&files, 0)).await.expect("first run");
    assert!(outcome.is_success());

    for _ in 0..3 {
        assert!(orchestrator.evaluate(input(&files, 0)).await.is_none());
    }
    assert_eq!(factory.spawned(), 1);

    let edited = [("index.tsx", "<board width=\"12mm\"/>")];
    let outcome = orchestrator.evaluate(input(&edited, 0)).await.expect("re-run");
    assert!(outcome.is_success());
    assert_eq!(factory.spawned(), 1, "worker reused across runs");

    let status = orchestrator.status();
    assert_eq!(status.state, RunState::Settled);
    assert!(!status.running);
    assert_eq!(status.runs_dispatched, 2);
}

#[tokio::test]
async fn missing_entrypoint_is_a_configuration_error_without_worker() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());
    let mut updates = orchestrator.subscribe();

    let outcome = orchestrator
        .evaluate(RunInput {
            snapshot: [("lib.ts", "export {}")].into_iter().collect(),
            entrypoint: None,
            trigger: 0,
        })
        .await
        .expect("dispatched");
    let failure = outcome.failure().expect("failed");
    assert_eq!(failure.kind, FailureKind::Configuration);

    let blank = orchestrator
        .evaluate(input(&[("index.tsx", "   \n")], 0))
        .await
        .expect("dispatched");
    assert_eq!(blank.failure().map(|f| f.kind), Some(FailureKind::Configuration));

    assert_eq!(factory.spawned(), 0, "worker never invoked");
    let errors = drain(&mut updates)
        .into_iter()
        .filter(|u| matches!(u, RenderUpdate::Error { .. }))
        .count();
    assert_eq!(errors, 2);
    assert_eq!(orchestrator.status().state, RunState::Errored);
}

#[tokio::test]
async fn compile_error_is_surfaced_without_prefix() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());

    let outcome = orchestrator
        .evaluate(input(&[("index.tsx", "syntax error <board")], 0))
        .await
        .expect("dispatched");
    let failure = outcome.failure().expect("failed").clone();
    assert_eq!(failure.kind, FailureKind::Compilation);
    assert_eq!(failure.message, "Unexpected token (1:7)");
    assert!(failure.stack.as_deref().unwrap_or_default().contains("SyntaxError"));
    assert_eq!(orchestrator.status().last_error, Some(failure));

    let fixed = orchestrator
        .evaluate(input(&[("index.tsx", "<board/>")], 0))
        .await
        .expect("dispatched");
    assert!(fixed.is_success());
    assert_eq!(factory.spawned(), 1, "compile errors keep the worker");
    assert!(orchestrator.status().last_error.is_none());
}

#[tokio::test]
async fn render_error_replaces_the_worker() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());

    let outcome = orchestrator
        .evaluate(input(&[("index.tsx", "explode")], 0))
        .await
        .expect("dispatched");
    let failure = outcome.failure().expect("failed");
    assert_eq!(failure.kind, FailureKind::Render);
    assert_eq!(failure.stack.as_deref(), Some("at render"));
    assert_eq!(factory.worker(0).kill_count.load(Ordering::SeqCst), 1);

    let outcome = orchestrator
        .evaluate(input(&[("index.tsx", "<board/>")], 0))
        .await
        .expect("dispatched");
    assert!(outcome.is_success());
    assert_eq!(factory.spawned(), 2);
}

#[tokio::test]
async fn spawn_failure_is_a_render_error() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());
    factory.broken.store(true, Ordering::SeqCst);

    let outcome = orchestrator
        .evaluate(input(&[("index.tsx", "<board/>")], 0))
        .await
        .expect("dispatched");
    let failure = outcome.failure().expect("failed");
    assert_eq!(failure.kind, FailureKind::Render);
    assert!(failure.message.contains("command not found"));
}

#[tokio::test]
async fn initial_render_is_published_before_finished() {
    let (_factory, orchestrator) = setup(OrchestratorOptions::default());
    let mut updates = orchestrator.subscribe();

    let outcome = orchestrator
        .evaluate(input(&[("index.tsx", "<board/>")], 0))
        .await
        .expect("dispatched");
    let RunOutcome::Succeeded(final_artifact) = outcome else {
        panic!("expected success, got {outcome:?}");
    };

    let updates = drain(&mut updates);
    assert!(matches!(updates.first(), Some(RenderUpdate::Started { .. })));
    let initial = updates
        .iter()
        .position(|u| matches!(u, RenderUpdate::InitialRender { .. }))
        .expect("initial render published");
    let finished = updates
        .iter()
        .position(|u| matches!(u, RenderUpdate::Finished { .. }))
        .expect("finished published");
    assert!(initial < finished);
    assert_eq!(
        updates[finished],
        RenderUpdate::Finished {
            run_id: updates[finished].run_id().expect("run id"),
            artifact: final_artifact,
        }
    );
}

#[tokio::test]
async fn progress_stays_in_bounds_and_ends_at_one() {
    let (_factory, orchestrator) = setup(OrchestratorOptions::default());
    let mut updates = orchestrator.subscribe();

    orchestrator
        .evaluate(input(&[("index.tsx", "<board/>")], 0))
        .await
        .expect("dispatched");

    let progress: Vec<f64> = drain(&mut updates)
        .into_iter()
        .filter_map(|u| match u {
            RenderUpdate::Progress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert!(progress.len() >= 3, "intermediate progress published: {progress:?}");
    assert_eq!(progress.first().copied(), Some(0.0), "each run starts from zero");
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "monotonic: {progress:?}");
    assert_eq!(progress.last().copied(), Some(1.0));
    assert_eq!(orchestrator.status().progress, 1.0);
}

#[tokio::test]
async fn stop_discards_the_worker_and_next_run_spawns_fresh() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());

    let handle = orchestrator
        .submit(input(&[("index.tsx", "slow <board/>")], 0))
        .await
        .expect("dispatched");
    wait_until_running(&orchestrator).await;

    orchestrator.stop().await;
    assert!(!orchestrator.is_running());
    assert_eq!(handle.await.expect("join"), RunOutcome::Cancelled);
    assert_eq!(factory.worker(0).kill_count.load(Ordering::SeqCst), 1);

    let outcome = orchestrator
        .evaluate(input(&[("index.tsx", "<board/>")], 0))
        .await
        .expect("dispatched");
    assert!(outcome.is_success());
    assert_eq!(factory.spawned(), 2, "killed worker is not reused");
}

#[tokio::test]
async fn new_input_preempts_a_running_render() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());
    let mut updates = orchestrator.subscribe();

    let first = orchestrator
        .submit(input(&[("index.tsx", "slow v1")], 0))
        .await
        .expect("dispatched");
    wait_until_running(&orchestrator).await;

    let second = orchestrator
        .submit(input(&[("index.tsx", "<board/> v2")], 0))
        .await
        .expect("dispatched");

    assert_eq!(first.await.expect("join"), RunOutcome::Cancelled);
    assert!(second.await.expect("join").is_success());
    assert_eq!(factory.spawned(), 2);

    let updates = drain(&mut updates);
    let stale_artifacts = updates
        .iter()
        .filter(|u| matches!(u, RenderUpdate::Finished { run_id, .. } if run_id.0 == 1))
        .count();
    assert_eq!(stale_artifacts, 0, "cancelled run never publishes a final artifact");
}

#[tokio::test]
async fn superseded_queued_runs_are_skipped() {
    let (factory, orchestrator) = setup(OrchestratorOptions::default());

    let first = orchestrator
        .submit(input(&[("index.tsx", "<board/> v1")], 0))
        .await
        .expect("dispatched");
    let second = orchestrator
        .submit(input(&[("index.tsx", "<board/> v2")], 0))
        .await
        .expect("dispatched");
    let third = orchestrator
        .submit(input(&[("index.tsx", "<board/> v3")], 0))
        .await
        .expect("dispatched");

    let outcomes = [
        first.await.expect("join"),
        second.await.expect("join"),
        third.await.expect("join"),
    ];
    assert!(outcomes[2].is_success(), "newest input always renders");
    assert!(outcomes[..2].iter().all(|o| *o == RunOutcome::Cancelled));

    let worker = factory.worker(factory.spawned() - 1);
    let rendered = worker.entry_content();
    assert_eq!(rendered, "<board/> v3");
}

#[tokio::test]
async fn manual_trigger_reruns_only_in_manual_mode() {
    let files = [("index.tsx", "<board/>")];

    let (_factory, auto) = setup(OrchestratorOptions::default());
    auto.evaluate(input(&files, 0)).await.expect("initial");
    assert!(auto.evaluate(input(&files, 1)).await.is_none());

    let (factory, manual) = setup(OrchestratorOptions {
        manual_run: true,
        ..OrchestratorOptions::default()
    });
    manual.evaluate(input(&files, 0)).await.expect("initial");
    let rerun = manual.evaluate(input(&files, 1)).await.expect("triggered");
    assert!(rerun.is_success());
    assert!(manual.evaluate(input(&files, 1)).await.is_none());
    assert_eq!(factory.spawned(), 1);
}

#[tokio::test]
async fn entrypoint_change_reruns() {
    let (_factory, orchestrator) = setup(OrchestratorOptions::default());
    let files: FileSnapshot = [("index.tsx", "<board/>"), ("main.tsx", "<board/>")]
        .into_iter()
        .collect();

    orchestrator
        .evaluate(RunInput {
            snapshot: files.clone(),
            entrypoint: Some("index.tsx".into()),
            trigger: 0,
        })
        .await
        .expect("initial");
    let switched = orchestrator
        .evaluate(RunInput {
            snapshot: files,
            entrypoint: Some("main.tsx".into()),
            trigger: 0,
        })
        .await
        .expect("entrypoint change runs");
    assert!(switched.is_success());
    assert_eq!(orchestrator.status().entrypoint.as_deref(), Some("main.tsx"));
}

#[tokio::test]
async fn edit_events_are_relayed() {
    let (_factory, orchestrator) = setup(OrchestratorOptions::default());
    let mut updates = orchestrator.subscribe();

    let event = runframe_core::EditEvent::new("edit-1", false).with_field("pcb_component_id", "R1");
    orchestrator.publish_edit_event(event.clone());
    assert_eq!(drain(&mut updates), vec![RenderUpdate::EditEvent { event }]);
}
