//! Per-call instance routing.
//!
//! One logical operation can write to a shared scope or to an isolated scope
//! owned by a single caller. The token travels inside the payload under
//! [`INSTANCE_SCOPE_KEY`]; this module only tags and reads it; it keeps no
//! data of its own.

use std::{fmt, sync::Arc};

use uuid::Uuid;

use super::payload::{merge, Payload, Value};

/// Reserved payload key carrying the instance scope token.
pub const INSTANCE_SCOPE_KEY: &str = "__instance_scope";

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InstanceScope(Arc<str>);

impl InstanceScope {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self(Arc::from(token.as_ref()))
    }

    /// A fresh, unique token.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InstanceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceScope({})", self.0)
    }
}

impl From<&str> for InstanceScope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Where data produced for an event should live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataRoute {
    Shared,
    Instance(InstanceScope),
}

pub fn tag(payload: &Payload, scope: &InstanceScope) -> Payload {
    let mut marker = Payload::new();
    marker.insert(
        INSTANCE_SCOPE_KEY.to_string(),
        Value::String(scope.as_str().to_string()),
    );
    merge(payload, &marker)
}

pub fn resolve(payload: &Payload) -> Option<InstanceScope> {
    payload
        .get(INSTANCE_SCOPE_KEY)
        .and_then(Value::as_str)
        .map(InstanceScope::new)
}

pub fn untag(payload: &Payload) -> Payload {
    let mut stripped = payload.clone();
    stripped.remove(INSTANCE_SCOPE_KEY);
    stripped
}

pub fn route(payload: &Payload) -> DataRoute {
    match resolve(payload) {
        Some(scope) => DataRoute::Instance(scope),
        None => DataRoute::Shared,
    }
}

/// Carries `scope` into a merged fan-out payload.
///
/// When `overrides` names the reserved key itself the entry is re-tagging on
/// purpose and the merged value is kept as is.
pub(crate) fn propagate(
    scope: Option<&InstanceScope>,
    merged: Payload,
    overrides: &Payload,
) -> Payload {
    if overrides.contains_key(INSTANCE_SCOPE_KEY) {
        return merged;
    }
    match scope {
        Some(scope) => tag(&merged, scope),
        None => merged,
    }
}
