//! Step outcomes and the reports emitted for them.

use serde::{Deserialize, Serialize};

/// Whether a step converged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step succeeded; the cursor advances.
    Success,
    /// The step failed; it is retried.
    Fail,
}

impl StepOutcome {
    /// Wire representation (`result` field of a state log).
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Outcome of one step execution together with its logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepResult {
    /// Success or failure.
    pub outcome: StepOutcome,
    /// Error output, if any.
    pub err_log: Option<String>,
    /// Standard output, if any.
    pub out_log: Option<String>,
}

impl StepResult {
    /// Successful result without logs.
    #[must_use]
    pub fn success() -> Self {
        Self {
            outcome: StepOutcome::Success,
            err_log: None,
            out_log: None,
        }
    }

    /// Failed result carrying an error log.
    #[must_use]
    pub fn fail(err_log: impl Into<String>) -> Self {
        Self {
            outcome: StepOutcome::Fail,
            err_log: Some(err_log.into()),
            out_log: None,
        }
    }

    /// Attach an output log.
    #[must_use]
    pub fn with_out_log(mut self, out_log: Option<String>) -> Self {
        self.out_log = out_log;
        self
    }
}

/// Report emitted by the execution thread after every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Version of the recipe the step belongs to.
    pub version: i64,
    /// Step identifier.
    pub step_id: String,
    /// What happened.
    pub result: StepResult,
}
