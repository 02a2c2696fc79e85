//! Envelope serialization.
//!
//! Decoding is total: every byte string maps to an envelope or a
//! [`DecodeError`]. The `action` key is looked up literally on the parsed
//! object before the envelope is materialized, so a string that merely
//! equals the key name (`"action":"action"`) is an unknown action.

use serde_json::Value;
use thiserror::Error;

use super::{Action, Envelope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not JSON, not an object, or a field of the wrong shape
    #[error("malformed message: {0}")]
    Malformed(String),

    /// `action` missing, not a string, or not in the vocabulary
    #[error("unknown action: {}", .0.as_deref().unwrap_or("<missing>"))]
    UnknownAction(Option<String>),
}

/// Serialization failure. Envelope fields are always representable, so this
/// indicates a local bug rather than a condition to retry.
#[derive(Debug, Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let fields = match &value {
        Value::Object(fields) => fields,
        other => {
            return Err(DecodeError::Malformed(format!(
                "expected a JSON object, got {}",
                json_kind(other)
            )))
        }
    };

    match fields.get("action") {
        Some(Value::String(token)) if Action::parse(token).is_some() => {}
        Some(Value::String(token)) => return Err(DecodeError::UnknownAction(Some(token.clone()))),
        Some(other) => return Err(DecodeError::UnknownAction(Some(other.to_string()))),
        None => return Err(DecodeError::UnknownAction(None)),
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
