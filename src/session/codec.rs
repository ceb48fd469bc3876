//! JSON framing of control-plane messages.
//!
//! Inbound text is decoded into a code plus the raw payload; payload
//! validation is left to the handlers. Outbound messages are typed structs
//! serialized with `serde_json`.

use serde::Serialize;
use serde_json::Value;

use super::codes::{InboundCode, OutboundCode};
use crate::models::{Identity, StepReport};
use crate::{AppError, Result};

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A message the agent knows how to handle.
    Known {
        /// Message code.
        code: InboundCode,
        /// Full message object.
        payload: Value,
    },
    /// Valid JSON without a recognised code.
    Unknown {
        /// The code found in the message, if any.
        code: Option<i64>,
    },
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns `AppError::Serialization` if `raw` is not valid JSON.
pub fn decode(raw: &str) -> Result<Inbound> {
    let payload: Value = serde_json::from_str(raw)?;
    let code = payload.get("code").and_then(Value::as_i64);
    match code.and_then(InboundCode::from_i64) {
        Some(code) => Ok(Inbound::Known { code, payload }),
        None => Ok(Inbound::Unknown { code }),
    }
}

#[derive(Debug, Serialize)]
struct HandshakeMessage<'a> {
    code: i64,
    instance_id: &'a str,
    app_id: &'a str,
    instance_token: &'a str,
    init_errors: &'a [String],
}

#[derive(Debug, Serialize)]
struct StateLogMessage<'a> {
    code: i64,
    init: &'a Identity,
    version: i64,
    id: &'a str,
    result: bool,
    err_log: Option<&'a str>,
    out_log: Option<&'a str>,
}

/// Encode the handshake announcing `identity`.
///
/// # Errors
///
/// Returns `AppError::Serialization` if encoding fails.
pub fn encode_handshake(identity: &Identity, init_errors: &[String]) -> Result<String> {
    let message = HandshakeMessage {
        code: OutboundCode::Handshake.as_i64(),
        instance_id: &identity.instance_id,
        app_id: &identity.app_id,
        instance_token: &identity.instance_token,
        init_errors,
    };
    serde_json::to_string(&message).map_err(|err| AppError::Serialization(err.to_string()))
}

/// Encode a step report on behalf of `identity`.
///
/// # Errors
///
/// Returns `AppError::Serialization` if encoding fails.
pub fn encode_state_log(identity: &Identity, report: &StepReport) -> Result<String> {
    let message = StateLogMessage {
        code: OutboundCode::StateLog.as_i64(),
        init: identity,
        version: report.version,
        id: &report.step_id,
        result: report.result.outcome.is_success(),
        err_log: report.result.err_log.as_deref(),
        out_log: report.result.out_log.as_deref(),
    };
    serde_json::to_string(&message).map_err(|err| AppError::Serialization(err.to_string()))
}
