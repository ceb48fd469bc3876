//! The execution thread and its shared cursor.
//!
//! Every piece of cursor state lives behind one mutex paired with one
//! condition variable. The execution thread blocks on the condvar while no
//! recipe is running, while a wait step is pending, and during the retry
//! delay after a failed step; control calls mutate the cursor and
//! `notify_all` so every blocked predicate is re-checked.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, info_span, warn};

use super::builtins::{self, Action, Builtin};
use super::reaper::ProcessReaper;
use super::runner::StepRunner;
use super::watch::{ChangeDetector, WatchState};
use super::{AbortMode, ExecutionControl, KillMode, LoadOutcome, ReportSink};
use crate::models::recipe::WATCH_TRIGGERED_KEY;
use crate::models::{Recipe, Step, StepReport, StepResult};
use crate::{AppError, Result};

/// Mutable state shared between the execution thread and control calls.
#[derive(Debug, Default)]
struct Cursor {
    recipe: Option<Arc<Recipe>>,
    version: Option<i64>,
    index: usize,
    done: HashSet<String>,
    running: bool,
    waiting: bool,
    in_step: bool,
    /// Bumped on every install so a finishing step can tell it was superseded.
    generation: u64,
    halt: Option<AbortMode>,
    stopped: bool,
}

impl Cursor {
    fn stop(&mut self) {
        self.running = false;
        self.stopped = true;
    }
}

/// Read-only view of the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorSnapshot {
    /// Installed recipe version.
    pub version: Option<i64>,
    /// Index of the next step to run.
    pub index: usize,
    /// Wait-step ids confirmed for the installed version.
    pub done: Vec<String>,
    /// Whether the cursor is walking the recipe.
    pub running: bool,
    /// Whether a wait step is blocked.
    pub waiting: bool,
}

struct Shared {
    cursor: Mutex<Cursor>,
    signal: Condvar,
    runner: Arc<dyn StepRunner>,
    sink: Arc<dyn ReportSink>,
    detector: ChangeDetector,
    reaper: ProcessReaper,
    retry_delay: Duration,
}

struct Job {
    recipe: Arc<Recipe>,
    index: usize,
    generation: u64,
}

impl Job {
    fn step(&self) -> Option<&Step> {
        self.recipe.steps().get(self.index)
    }
}

/// Runs the installed recipe on a dedicated thread.
pub struct RecipeExecutor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecipeExecutor {
    /// Build an executor. The thread is not started until [`Self::start`].
    #[must_use]
    pub fn new(
        runner: Arc<dyn StepRunner>,
        sink: Arc<dyn ReportSink>,
        detector: ChangeDetector,
        reaper: ProcessReaper,
        retry_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cursor: Mutex::new(Cursor::default()),
                signal: Condvar::new(),
                runner,
                sink,
                detector,
                reaper,
                retry_delay,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the execution thread. Calling it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the thread cannot be spawned.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("recipe-executor".into())
            .spawn(move || shared.run_loop())?;
        *handle = Some(spawned);
        Ok(())
    }

    /// Permanently stop the execution thread according to `mode`.
    pub fn abort(&self, mode: AbortMode) {
        info!(?mode, "aborting recipe execution");
        if mode == AbortMode::Now {
            self.kill(KillMode::Soft);
        }

        let mut cursor = self.shared.lock();
        match mode {
            AbortMode::Now => cursor.stop(),
            AbortMode::AfterStep => {
                if cursor.in_step {
                    cursor.halt = Some(mode);
                    // A pending wait would never finish on its own.
                    if cursor.waiting {
                        cursor.running = false;
                    }
                } else {
                    cursor.stop();
                }
            }
            AbortMode::AfterRecipe => {
                if cursor.running {
                    cursor.halt = Some(mode);
                } else {
                    cursor.stop();
                }
            }
        }
        self.shared.signal.notify_all();
    }

    /// Whether an abort has been requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        let cursor = self.shared.lock();
        cursor.stopped || cursor.halt.is_some()
    }

    /// Block until the execution thread has ended.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("execution thread panicked");
            }
        }
    }

    /// Current cursor state.
    #[must_use]
    pub fn snapshot(&self) -> CursorSnapshot {
        let cursor = self.shared.lock();
        let mut done: Vec<String> = cursor.done.iter().cloned().collect();
        done.sort();
        CursorSnapshot {
            version: cursor.version,
            index: cursor.index,
            done,
            running: cursor.running,
            waiting: cursor.waiting,
        }
    }
}

impl ExecutionControl for RecipeExecutor {
    fn load(&self, version: i64, steps: Option<Vec<Step>>) -> Result<LoadOutcome> {
        let mut cursor = self.shared.lock();
        if cursor.stopped {
            warn!(version, "execution halted, recipe ignored");
            return Ok(LoadOutcome::Halted);
        }
        if cursor.running && cursor.version == Some(version) {
            info!(version, "recipe already running");
            return Ok(LoadOutcome::AlreadyCurrent);
        }

        let steps = match steps {
            Some(steps) => steps,
            None => cursor
                .recipe
                .as_ref()
                .map(|recipe| recipe.steps().to_vec())
                .unwrap_or_default(),
        };
        let recipe = Recipe::new(version, steps)?;

        cursor.version = Some(version);
        cursor.index = 0;
        cursor.done.clear();
        cursor.generation += 1;

        if recipe.is_empty() {
            info!(version, "recipe has no steps, staying idle");
            cursor.recipe = None;
            cursor.running = false;
            self.shared.signal.notify_all();
            return Ok(LoadOutcome::Idle);
        }

        info!(version, steps = recipe.len(), "recipe installed");
        cursor.recipe = Some(Arc::new(recipe));
        cursor.running = true;
        self.shared.signal.notify_all();
        Ok(LoadOutcome::Installed)
    }

    fn kill(&self, mode: KillMode) {
        let was_running = {
            let mut cursor = self.shared.lock();
            let was_running = cursor.running;
            if was_running {
                if cursor.waiting {
                    debug!("releasing pending wait step");
                }
                cursor.running = false;
                if cursor.halt.is_some() && !cursor.in_step {
                    cursor.stop();
                }
                self.shared.signal.notify_all();
            }
            was_running
        };

        if was_running {
            let reaped = self.shared.reaper.reap();
            info!(
                killed = reaped.killed.len(),
                failed = reaped.failed.len(),
                "recipe execution killed"
            );
        } else {
            debug!("kill requested while idle");
        }

        if mode == KillMode::Wait {
            let mut cursor = self.shared.lock();
            while cursor.in_step {
                cursor = self.shared.wait(cursor);
            }
        }
    }

    fn state_done(&self, id: &str) {
        let mut cursor = self.shared.lock();
        if cursor.done.insert(id.to_owned()) {
            debug!(id, "state marked done");
        }
        self.shared.signal.notify_all();
    }

    fn version(&self) -> Option<i64> {
        self.shared.lock().version
    }

    fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    fn is_waiting(&self) -> bool {
        self.shared.lock().waiting
    }
}

impl std::fmt::Debug for RecipeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeExecutor")
            .field("cursor", &self.snapshot())
            .finish_non_exhaustive()
    }
}

// ── Execution thread ────────────────────────────────────────────────

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Cursor>) -> MutexGuard<'a, Cursor> {
        self.signal.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let cursor = self.lock();
        cursor.running && cursor.generation == generation
    }

    /// Reports keep being retried only while nothing asked the thread to halt.
    fn keeps_delivering(&self, generation: u64) -> bool {
        let cursor = self.lock();
        cursor.running && cursor.generation == generation && cursor.halt.is_none()
    }

    fn run_loop(&self) {
        info!("execution thread started");
        while let Some(job) = self.next_job() {
            let result = match job.step() {
                Some(step) => {
                    let span = info_span!(
                        "step",
                        version = job.recipe.version(),
                        step_id = %step.id,
                        module = %step.module
                    );
                    let _guard = span.enter();
                    self.execute(step)
                }
                None => StepResult::fail(format!("no step at index {}", job.index)),
            };
            self.finish(&job, result);
        }
        info!("execution thread stopped");
    }

    /// Block until a step is ready, then claim it.
    fn next_job(&self) -> Option<Job> {
        let mut cursor = self.lock();
        loop {
            if cursor.stopped {
                return None;
            }
            if cursor.running {
                if let Some(recipe) = cursor.recipe.clone() {
                    let index = cursor.index % recipe.len().max(1);
                    cursor.in_step = true;
                    return Some(Job {
                        recipe,
                        index,
                        generation: cursor.generation,
                    });
                }
            }
            cursor = self.wait(cursor);
        }
    }

    fn execute(&self, step: &Step) -> StepResult {
        match builtins::resolve(&step.module) {
            Action::Builtin(Builtin::Wait) => self.wait_for(step),
            Action::Module(module) => self.run_module(step, module),
        }
    }

    fn run_module(&self, step: &Step, module: &str) -> StepResult {
        let mut parameters = step.parameters.clone();

        let watch = match step.watch_path() {
            None => None,
            Some(path) => match self.detector.check(&step.id, Path::new(path)) {
                Ok(state) => {
                    if state.is_changed() {
                        info!(path, "watched file changed");
                        parameters.insert(WATCH_TRIGGERED_KEY.to_owned(), Value::Bool(true));
                    }
                    Some(state)
                }
                Err(err) => {
                    warn!(path, %err, "watched file unavailable");
                    return StepResult::fail(err.to_string());
                }
            },
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.runner.execute(&step.id, module, &parameters)
        }));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(%err, "step raised an error");
                StepResult::fail(AppError::Step(err.to_string()).to_string())
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(panic = %msg, "step panicked");
                StepResult::fail(AppError::Step(format!("panicked: {msg}")).to_string())
            }
        };

        if result.outcome.is_success() {
            if let Some(state) = watch.as_ref().filter(|s| s.needs_record()) {
                self.commit_watch(step, state);
            }
        }
        result
    }

    fn commit_watch(&self, step: &Step, state: &WatchState) {
        if let Err(err) = self.detector.record(&step.id, state.fingerprint()) {
            warn!(%err, "failed to store watch fingerprint");
        }
    }

    fn wait_for(&self, step: &Step) -> StepResult {
        let target = match builtins::wait_target(&step.parameters) {
            Ok(target) => target,
            Err(err) => {
                error!(%err, "wrong wait request");
                return StepResult::fail(err.to_string());
            }
        };

        info!(
            state = %target.state,
            instance_id = %target.instance_id,
            "waiting for state"
        );

        let mut cursor = self.lock();
        let generation = cursor.generation;
        cursor.waiting = true;
        while cursor.running
            && cursor.generation == generation
            && cursor.halt != Some(AbortMode::AfterStep)
            && !cursor.done.contains(&step.id)
        {
            cursor = self.wait(cursor);
        }
        cursor.waiting = false;
        let completed = cursor.done.contains(&step.id);
        drop(cursor);

        if completed {
            info!("wait complete");
            StepResult::success()
        } else {
            warn!("wait aborted");
            StepResult::fail(format!(
                "wait for state {} on {} aborted",
                target.state, target.instance_id
            ))
        }
    }

    fn finish(&self, job: &Job, result: StepResult) {
        let step_id = job
            .step()
            .map_or_else(String::new, |step| step.id.clone());
        let success = result.outcome.is_success();
        let report = StepReport {
            version: job.recipe.version(),
            step_id,
            result,
        };

        if self.is_current(job.generation) {
            info!(step_id = %report.step_id, success, "reporting step");
            let keep_going = || self.keeps_delivering(job.generation);
            if let Err(err) = self.sink.deliver(&report, &keep_going) {
                warn!(step_id = %report.step_id, %err, "step report dropped");
            }
        } else {
            warn!(step_id = %report.step_id, "execution aborted during step");
            if let Err(err) = self.sink.deliver(&report, &|| false) {
                debug!(%err, "abort report not delivered");
            }
        }

        let mut cursor = self.lock();
        cursor.in_step = false;
        let current = cursor.running && cursor.generation == job.generation;

        if current && success {
            cursor.index = (job.index + 1) % job.recipe.len().max(1);
            if cursor.index == 0 {
                debug!(version = job.recipe.version(), "recipe complete, restarting");
                if cursor.halt == Some(AbortMode::AfterRecipe) {
                    cursor.stop();
                }
            }
        }

        // A killed cursor never reaches the end of its recipe.
        if cursor.halt == Some(AbortMode::AfterStep) || (cursor.halt.is_some() && !cursor.running) {
            cursor.stop();
        }
        self.signal.notify_all();

        if current && !success && !cursor.stopped {
            debug!(delay_ms = self.retry_delay.as_millis(), "retrying failed step");
            let (guard, _) = self
                .signal
                .wait_timeout_while(cursor, self.retry_delay, |c| {
                    c.running && c.generation == job.generation && !c.stopped
                })
                .unwrap_or_else(PoisonError::into_inner);
            drop(guard);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
