//! Recipe execution: a dedicated thread that walks the installed recipe
//! forever, plus the seams it talks through.
//!
//! The session layer drives the executor only through [`ExecutionControl`];
//! the executor emits reports only through [`ReportSink`].

pub mod builtins;
pub mod reaper;
pub mod runner;
pub mod watch;
pub mod worker;

pub use reaper::{ProcFs, ProcessEntry, ProcessReaper, ProcessTable};
pub use runner::{CommandRunner, StepRunner};
pub use watch::{ChangeDetector, WatchState};
pub use worker::{CursorSnapshot, RecipeExecutor};

use crate::models::{Step, StepReport};
use crate::Result;

/// How a kill request treats the step currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Stop the cursor and return immediately.
    Soft,
    /// Stop the cursor and block until the in-flight step has finished.
    Wait,
}

/// When a permanent shutdown of the execution thread takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AbortMode {
    /// Kill the current step and stop.
    Now,
    /// Let the current step finish, then stop.
    AfterStep,
    /// Keep going until the cursor wraps to the first step, then stop.
    AfterRecipe,
}

/// Result of a [`ExecutionControl::load`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A new recipe was installed and the cursor restarted at step 0.
    Installed,
    /// The same version is already running; nothing changed.
    AlreadyCurrent,
    /// The version was recorded but there is nothing to run.
    Idle,
    /// The execution thread has been aborted and accepts no more work.
    Halted,
}

/// Control surface of the execution thread.
pub trait ExecutionControl: Send + Sync {
    /// Install recipe `version`. When `steps` is `None` the previously
    /// installed steps are kept under the new version.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the steps contain duplicate ids.
    fn load(&self, version: i64, steps: Option<Vec<Step>>) -> Result<LoadOutcome>;

    /// Stop execution of the current recipe and reap child processes.
    fn kill(&self, mode: KillMode);

    /// Record that the wait step `id` has been satisfied.
    fn state_done(&self, id: &str);

    /// Version of the installed recipe, if any.
    fn version(&self) -> Option<i64>;

    /// Whether the cursor is currently walking a recipe.
    fn is_running(&self) -> bool;

    /// Whether the current step is blocked in a wait.
    fn is_waiting(&self) -> bool;
}

/// Destination of step reports.
pub trait ReportSink: Send + Sync {
    /// Deliver `report`. Transient failures are retried for as long as
    /// `keep_going` returns true.
    ///
    /// # Errors
    ///
    /// Returns the last delivery error once the sink gives up.
    fn deliver(&self, report: &StepReport, keep_going: &dyn Fn() -> bool) -> Result<()>;
}
