//! Event payload values and the merge rule shared by every fan-out.

use std::{collections::BTreeMap, time::Duration};

use super::event_bus::{EventError, EventResult};

/// Ordered map carried by every event.
pub type Payload = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    List(Vec<Value>),
    Map(Payload),
    Duration(Duration),
    Null,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Duration> for Value {
    fn from(value: Duration) -> Self {
        Value::Duration(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Payload> for Value {
    fn from(value: Payload) -> Self {
        Value::Map(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Integer(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Value::from(f),
            Value::String(s) => serde_json::Value::String(s),
            Value::Boolean(b) => serde_json::Value::Bool(b),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
            // milliseconds, matching the config format
            Value::Duration(d) => serde_json::Value::from(d.as_millis() as u64),
            Value::Null => serde_json::Value::Null,
        }
    }
}

/// Converts a JSON object into a payload. Anything else is rejected.
pub fn payload_from_json(value: serde_json::Value) -> EventResult<Payload> {
    match Value::from(value) {
        Value::Map(payload) => Ok(payload),
        Value::Null => Ok(Payload::new()),
        other => Err(EventError::InvalidPayload {
            message: format!("expected a JSON object, got {:?}", other),
        }),
    }
}

pub fn payload_to_json(payload: &Payload) -> serde_json::Value {
    Value::Map(payload.clone()).into()
}

/// Combines a triggering payload with a handler-specific override map.
///
/// Every key of `original` is kept; keys present in `overrides` take the
/// override's value, and keys only in `overrides` are added. Neither input is
/// modified.
pub fn merge(original: &Payload, overrides: &Payload) -> Payload {
    let mut merged = original.clone();
    merged.extend(
        overrides
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    merged
}

/// Builds a [`Payload`] from `key => value` pairs.
///
/// ```rust
/// let payload = synapse::payload! { "ticketId" => "T-001", "priority" => 2 };
/// assert_eq!(payload.len(), 2);
/// ```
#[macro_export]
macro_rules! payload {
    () => {
        $crate::event::payload::Payload::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut payload = $crate::event::payload::Payload::new();
        $(
            payload.insert(
                ::std::string::ToString::to_string(&$key),
                $crate::event::payload::Value::from($value),
            );
        )+
        payload
    }};
}
