//! Event records fed through templates.

use crate::error::Error;
use serde_json::{Map, Value};

/// An incoming record: string keys in arrival order, loosely typed values.
pub type Event = Map<String, Value>;

/// Converts an arbitrary JSON value into an event. Only objects qualify.
pub fn from_value(value: Value) -> Result<Event, Error> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::evaluation(format!(
            "event must be a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

/// Parses one NDJSON line into an event.
pub fn from_str(line: &str) -> Result<Event, Error> {
    let value: Value = serde_json::from_str(line).map_err(|source| Error::SerdeJson { source })?;
    from_value(value)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
