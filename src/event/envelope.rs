use uuid::Uuid;

use super::{
    event_bus::EventResult,
    instance::{self, InstanceScope},
    namespace::EventName,
    payload::Payload,
};
use crate::timestamp::Timestamp;

/// # EventEnvelope
///
/// One emitted event. Envelopes are immutable: every fan-out produces a new
/// envelope whose `parent` is the id of the envelope that triggered it.
///
/// The instance scope is read from the payload's reserved key when the
/// envelope is built, so it always agrees with the payload.
///
/// ```rust
/// use synapse::envelope::EventEnvelope;
/// use synapse::namespace::EventName;
///
/// let envelope = EventEnvelope::builder(EventName::parse("support.tickets.new").unwrap())
///     .payload(synapse::payload! { "ticketId" => "T-001" })
///     .source("support-desk")
///     .build();
/// assert_eq!(envelope.name().as_str(), "support.tickets.new");
/// assert!(envelope.instance_scope().is_none());
/// ```
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    id: Uuid,
    parent: Option<Uuid>,
    name: EventName,
    payload: Payload,
    source: String,
    instance_scope: Option<InstanceScope>,
    timestamp: Timestamp,
}

impl EventEnvelope {
    pub fn builder(name: EventName) -> EnvelopeBuilder {
        EnvelopeBuilder::new(name)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn name(&self) -> &EventName {
        &self.name
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn instance_scope(&self) -> Option<&InstanceScope> {
        self.instance_scope.as_ref()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

pub struct EnvelopeBuilder {
    name: EventName,
    payload: Payload,
    source: Option<String>,
    parent: Option<Uuid>,
    instance_scope: Option<InstanceScope>,
}

impl EnvelopeBuilder {
    fn new(name: EventName) -> Self {
        Self {
            name,
            payload: Payload::new(),
            source: None,
            parent: None,
            instance_scope: None,
        }
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn parent(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Tags the payload with `scope`.
    pub fn instance_scope(mut self, scope: InstanceScope) -> Self {
        self.instance_scope = Some(scope);
        self
    }

    pub fn build(self) -> EventEnvelope {
        let payload = match &self.instance_scope {
            Some(scope) => instance::tag(&self.payload, scope),
            None => self.payload,
        };
        let instance_scope = instance::resolve(&payload);
        EventEnvelope {
            id: Uuid::new_v4(),
            parent: self.parent,
            name: self.name,
            payload,
            source: self.source.unwrap_or_default(),
            instance_scope,
            timestamp: Timestamp::now(),
        }
    }
}

/// One downstream emission declared on a triggering call.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerEntry {
    pub target: EventName,
    pub overrides: Payload,
}

impl HandlerEntry {
    pub fn new(target: &str, overrides: Payload) -> EventResult<Self> {
        Ok(Self {
            target: EventName::parse(target)?,
            overrides,
        })
    }
}
