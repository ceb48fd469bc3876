//! End-to-end recipe flow: real execution thread, relay, and session, with
//! the socket writer replaced by a recording task.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use recipe_agent::executor::{
    AbortMode, ChangeDetector, ExecutionControl, ProcessEntry, ProcessReaper, ProcessTable,
    RecipeExecutor, StepRunner,
};
use recipe_agent::models::{Parameters, StepResult};
use recipe_agent::module_source::{ModuleSource, ModuleSourceStore};
use recipe_agent::session::{Outbound, Relay, ReportChannel, SessionContext, SessionManager};
use recipe_agent::update::UpdateScheduler;
use recipe_agent::Result;

use super::test_helpers::{eventually, spawn_writer, RecordingUpdater, RotatingIdentity, Wire};

struct AlwaysSucceeds;

impl StepRunner for AlwaysSucceeds {
    fn execute(&self, step_id: &str, _module: &str, _parameters: &Parameters) -> Result<StepResult> {
        Ok(StepResult::success().with_out_log(Some(format!("ran {step_id}"))))
    }
}

struct NoChildren;

impl ProcessTable for NoChildren {
    fn list(&self) -> Result<Vec<ProcessEntry>> {
        Ok(Vec::new())
    }

    fn terminate(&self, _pid: i32) -> Result<()> {
        Ok(())
    }
}

struct Flow {
    executor: Arc<RecipeExecutor>,
    relay: Arc<Relay>,
    session: Arc<SessionManager>,
    wire: Arc<Wire>,
    _state: tempfile::TempDir,
}

impl Flow {
    fn start() -> Self {
        let state = tempfile::tempdir().expect("tempdir");
        let relay = Arc::new(Relay::new(Duration::from_millis(10)));
        let executor = Arc::new(RecipeExecutor::new(
            Arc::new(AlwaysSucceeds),
            Arc::clone(&relay) as Arc<dyn recipe_agent::executor::ReportSink>,
            ChangeDetector::new(state.path().join("watch")),
            ProcessReaper::new(Box::new(NoChildren), 1),
            Duration::from_millis(10),
        ));
        executor.start().expect("start executor");

        let ctx = Arc::new(SessionContext {
            executor: Arc::clone(&executor) as Arc<dyn ExecutionControl>,
            identity: Arc::new(RotatingIdentity::default()),
            updater: Arc::new(RecordingUpdater::default()) as Arc<dyn UpdateScheduler>,
            module_source: Arc::new(ModuleSourceStore::in_memory(ModuleSource::new(
                "https://git.example.com/modules.git",
                "v1",
            ))),
            init_errors: Vec::new(),
            handshake_retry: Duration::ZERO,
        });
        let (outbound, frames) = Outbound::channel();
        let session = Arc::new(SessionManager::new(ctx, outbound).expect("session"));
        let (wire, _writer) = spawn_writer(frames, false);
        relay.bind(Arc::clone(&session) as Arc<dyn ReportChannel>);

        Self {
            executor,
            relay,
            session,
            wire,
            _state: state,
        }
    }

    /// `(id, result)` of every state log sent so far.
    fn reports(&self) -> Vec<(String, bool)> {
        self.wire
            .with_code(2)
            .iter()
            .map(|v| {
                (
                    v["id"].as_str().unwrap_or_default().to_owned(),
                    v["result"].as_bool().unwrap_or_default(),
                )
            })
            .collect()
    }

    async fn stop(self) {
        self.relay.unbind();
        self.executor.abort(AbortMode::Now);
        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || executor.join())
            .await
            .expect("join executor");
    }
}

fn recipe(version: i64, steps: &Value) -> String {
    json!({
        "code": 5,
        "recipe_version": version,
        "state": steps,
    })
    .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recipe_runs_until_wait_then_resumes_on_signal() {
    let flow = Flow::start();
    flow.session.on_open().await.expect("handshake");

    let steps = json!([
        { "id": "A", "module": "file", "parameter": {} },
        { "id": "W", "module": "general.wait", "parameter": { "state": "db", "instance_id": "i-2" } }
    ]);
    flow.session
        .receive(&recipe(1, &steps))
        .await
        .expect("recipe accepted");

    eventually("first report and wait", || {
        flow.reports() == vec![("A".to_owned(), true)] && flow.executor.is_waiting()
    })
    .await;
    assert_eq!(flow.wire.with_code(2)[0]["out_log"], "ran A");

    flow.session
        .receive(r#"{"code": 6, "version": 1, "id": "W"}"#)
        .await
        .expect("signal accepted");

    eventually("wait step report and wrap", || flow.reports().len() >= 3).await;
    let reports = flow.reports();
    assert_eq!(reports[1], ("W".to_owned(), true));
    assert_eq!(reports[2], ("A".to_owned(), true));

    flow.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_recipe_keeps_previous_version_running() {
    let flow = Flow::start();
    flow.session.on_open().await.expect("handshake");

    let steps = json!([
        { "id": "W", "module": "general.wait", "parameter": { "state": "db", "instance_id": "i-2" } }
    ]);
    flow.session
        .receive(&recipe(1, &steps))
        .await
        .expect("recipe accepted");
    eventually("wait step", || flow.executor.is_waiting()).await;

    let duplicate = json!([
        { "id": "X", "module": "file", "parameter": {} },
        { "id": "X", "module": "file", "parameter": {} }
    ]);
    flow.session
        .receive(&recipe(2, &duplicate))
        .await
        .expect("rejection contained");

    assert_eq!(flow.executor.version(), Some(1));
    assert!(flow.executor.is_running());
    assert!(flow.executor.is_waiting());
    assert!(flow.reports().is_empty());

    flow.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_version_fails_pending_wait_and_restarts() {
    let flow = Flow::start();
    flow.session.on_open().await.expect("handshake");

    let steps = json!([
        { "id": "W", "module": "general.wait", "parameter": { "state": "db", "instance_id": "i-2" } }
    ]);
    flow.session
        .receive(&recipe(1, &steps))
        .await
        .expect("v1 accepted");
    eventually("wait step", || flow.executor.is_waiting()).await;

    flow.session
        .receive(&recipe(2, &steps))
        .await
        .expect("v2 accepted");

    eventually("aborted wait report", || !flow.reports().is_empty()).await;
    let logs = flow.wire.with_code(2);
    let aborted = &logs[0];
    assert_eq!(aborted["version"], 1);
    assert_eq!(aborted["result"], false);

    eventually("wait under v2", || flow.executor.is_waiting()).await;
    assert_eq!(flow.executor.version(), Some(2));

    flow.stop().await;
}
