//! Builtin step handlers and the module dispatch table.

use serde_json::Value;

use crate::models::Parameters;
use crate::{AppError, Result};

/// Steps the agent handles itself instead of delegating to the step runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Block until the control plane reports the awaited state as done.
    Wait,
}

const BUILTINS: &[(&str, Builtin)] = &[("general.wait", Builtin::Wait), ("wait", Builtin::Wait)];

/// How a step module is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    /// Handled by the agent.
    Builtin(Builtin),
    /// Delegated to the step runner.
    Module(&'a str),
}

/// Resolve `module` against the builtin table.
#[must_use]
pub fn resolve(module: &str) -> Action<'_> {
    BUILTINS
        .iter()
        .find(|(name, _)| *name == module)
        .map_or(Action::Module(module), |(_, builtin)| Action::Builtin(*builtin))
}

/// What a wait step waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitTarget {
    /// Awaited state on the remote instance.
    pub state: String,
    /// Instance that has to reach the state.
    pub instance_id: String,
}

/// Extract the wait target from step parameters.
///
/// # Errors
///
/// Returns `AppError::WaitConfig` if either field is missing or blank.
pub fn wait_target(parameters: &Parameters) -> Result<WaitTarget> {
    let state = first_str(parameters, &["state", "state_id", "stateid"])
        .ok_or_else(|| AppError::WaitConfig("missing state".into()))?;
    let instance_id = first_str(parameters, &["instance_id", "instanceid"])
        .ok_or_else(|| AppError::WaitConfig("missing instance_id".into()))?;
    Ok(WaitTarget {
        state: state.to_owned(),
        instance_id: instance_id.to_owned(),
    })
}

fn first_str<'a>(parameters: &'a Parameters, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| parameters.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}
