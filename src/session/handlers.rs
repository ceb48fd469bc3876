//! Validation of inbound action payloads.
//!
//! Each parser takes the full inbound message object and either returns a
//! typed request or an `AppError::Protocol`. Parsers never touch shared
//! state; the session manager decides what to do with the result.

use serde_json::Value;

use crate::models::recipe::ensure_unique_ids;
use crate::models::{Parameters, Step};
use crate::module_source::ModuleSource;
use crate::{AppError, Result};

/// A validated `RecipeData` message.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeRequest {
    /// Recipe version.
    pub version: i64,
    /// Module source to use from now on.
    pub module: ModuleSource,
    /// New steps, or `None` to keep the installed ones.
    pub steps: Option<Vec<Step>>,
}

/// A validated `WaitDone` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitDone {
    /// Recipe version the signal belongs to.
    pub version: i64,
    /// Id of the satisfied wait step.
    pub id: String,
}

/// A validated `AgentUpdate` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUpdate {
    /// Version to update to.
    pub version: String,
    /// Where to fetch the update from.
    pub url: String,
}

/// Validate a `RecipeData` message.
///
/// Without a module descriptor in the message, `configured` must already
/// carry a repo and a tag.
///
/// # Errors
///
/// Returns `AppError::Protocol` describing the first invalid field.
pub fn parse_recipe(data: &Value, configured: &ModuleSource) -> Result<RecipeRequest> {
    let version = version_field(data)?;

    let module = match data.get("module").and_then(Value::as_object) {
        Some(module) => {
            let repo = non_empty_str(module.get("repo"))
                .ok_or_else(|| AppError::Protocol("invalid module repo".into()))?;
            let tag = non_empty_str(module.get("tag"))
                .ok_or_else(|| AppError::Protocol("invalid module tag".into()))?;
            ModuleSource::new(repo, tag)
        }
        None if configured.is_complete() => configured.clone(),
        None => {
            return Err(AppError::Protocol(
                "no module source in message and none configured".into(),
            ))
        }
    };

    let steps = match first_present(data, &["state", "steps"]) {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) if items.is_empty() => None,
        Some(Value::Array(items)) => {
            let steps = items
                .iter()
                .enumerate()
                .map(|(index, item)| parse_step(index, item))
                .collect::<Result<Vec<_>>>()?;
            ensure_unique_ids(&steps)?;
            Some(steps)
        }
        Some(_) => return Err(AppError::Protocol("invalid steps: not a list".into())),
    };

    Ok(RecipeRequest {
        version,
        module,
        steps,
    })
}

/// Validate a `WaitDone` message.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the version or the id is missing.
pub fn parse_wait_done(data: &Value) -> Result<WaitDone> {
    let version = version_field(data)?;
    let id = non_empty_str(data.get("id"))
        .ok_or_else(|| AppError::Protocol("invalid state id".into()))?;
    Ok(WaitDone {
        version,
        id: id.to_owned(),
    })
}

/// Validate an `AgentUpdate` message.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the version or the url is missing.
pub fn parse_agent_update(data: &Value) -> Result<AgentUpdate> {
    let version = match data.get("version") {
        Some(Value::String(v)) if !v.trim().is_empty() => v.trim().to_owned(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(AppError::Protocol("invalid update version".into())),
    };
    let url = non_empty_str(data.get("url"))
        .ok_or_else(|| AppError::Protocol("invalid update url".into()))?;
    Ok(AgentUpdate {
        version,
        url: url.to_owned(),
    })
}

// ── Private helpers ─────────────────────────────────────────────────

fn parse_step(index: usize, item: &Value) -> Result<Step> {
    let Some(obj) = item.as_object() else {
        return Err(AppError::Protocol(format!("invalid step {index}: not an object")));
    };

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Protocol(format!("invalid step {index}: missing id")))?;
    let module = obj
        .get("module")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Protocol(format!("invalid step '{id}': missing module")))?;
    let parameters = match obj.get("parameter").or_else(|| obj.get("parameters")) {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) => Parameters::new(),
        Some(_) => {
            return Err(AppError::Protocol(format!(
                "invalid step '{id}': parameters must be an object"
            )))
        }
        None => {
            return Err(AppError::Protocol(format!(
                "invalid step '{id}': missing parameters"
            )))
        }
    };

    Ok(Step::new(id, module, parameters))
}

fn version_field(data: &Value) -> Result<i64> {
    first_present(data, &["recipe_version", "version"])
        .and_then(Value::as_i64)
        .ok_or_else(|| AppError::Protocol("invalid recipe version".into()))
}

fn first_present<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| data.get(*key))
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}
