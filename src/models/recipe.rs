//! Recipes and the steps they are made of.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Free-form step parameters as sent by the control plane.
pub type Parameters = serde_json::Map<String, Value>;

/// Parameter naming the file whose content gates a step.
pub const WATCH_KEY: &str = "watch";

/// Parameter injected when a watched file changed since the last successful run.
pub const WATCH_TRIGGERED_KEY: &str = "watch-triggered";

/// One unit of work in a recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Step {
    /// Identifier, unique within its recipe.
    pub id: String,
    /// Builtin handler name or module delegated to the step runner.
    pub module: String,
    /// Module parameters.
    #[serde(default)]
    pub parameters: Parameters,
}

impl Step {
    /// Build a step.
    #[must_use]
    pub fn new(id: impl Into<String>, module: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            id: id.into(),
            module: module.into(),
            parameters,
        }
    }

    /// Path of the watched file, if the step is watch-gated.
    #[must_use]
    pub fn watch_path(&self) -> Option<&str> {
        self.parameters
            .get(WATCH_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }
}

/// A versioned, ordered list of steps. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    version: i64,
    steps: Vec<Step>,
}

impl Recipe {
    /// Build a recipe, rejecting duplicate step ids.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if two steps share an id.
    pub fn new(version: i64, steps: Vec<Step>) -> Result<Self> {
        ensure_unique_ids(&steps)?;
        Ok(Self { version, steps })
    }

    /// Recipe version.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the recipe has no step to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Reject step lists in which two steps share an id.
///
/// # Errors
///
/// Returns `AppError::Protocol` naming the first duplicated id.
pub fn ensure_unique_ids(steps: &[Step]) -> Result<()> {
    let mut seen = HashSet::with_capacity(steps.len());
    match steps.iter().find(|step| !seen.insert(step.id.as_str())) {
        Some(dup) => Err(AppError::Protocol(format!("duplicate step id '{}'", dup.id))),
        None => Ok(()),
    }
}
