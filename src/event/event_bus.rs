//! # Event Bus
//!
//! The EventBus is the dispatcher at the center of the runtime. Producers emit
//! named events; every subscription whose pattern and scope accept the event
//! gets its own delivery task, and the producer never waits for any of them.
//!
//! ## Features
//!
//! - **Pattern Dispatch**: subscriptions are resolved from a lock-free registry
//!   snapshot and the namespace matcher
//! - **Enhanced Handlers**: one emit can fan out to several downstream events,
//!   each with its own payload overrides, in declared order
//! - **Instance Routing**: the instance scope of a triggering event follows its
//!   fan-out unless an entry re-tags it
//! - **Fault Isolation**: handler errors and panics are caught at the delivery
//!   boundary, logged, counted and broadcast on a fault channel
//! - **Deferred Continuations**: events scheduled within a bounded delay window
//!
//! ## Delivery Model
//!
//! ```text
//! emit ──▶ snapshot ──▶ match ──▶ spawn delivery (one task per subscription)
//!   │
//!   └──▶ for each HandlerEntry, in order: merge ──▶ propagate scope ──▶ emit
//! ```
//!
//! A delivery re-checks its subscription just before invoking the handler, so
//! unsubscribing or unregistering an agent stops every delivery that has not
//! started yet. Deliveries already running are left to finish.
//!
//! ## Shutdown
//!
//! [`EventBus::shutdown`] stops accepting work, cancels pending deferred tasks
//! and waits a grace period for running handlers. Handlers still running after
//! the grace period are reported, never aborted.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Notify},
    time::{timeout_at, Instant},
};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    deferred::{DeferredEmitter, DeferredHandle, DeferredSink, DeferredTask, DelayStrategy},
    envelope::{EventEnvelope, HandlerEntry},
    instance,
    namespace::{EventName, Pattern},
    payload::{merge, Payload, Value},
    subscription::{
        EventHandler, Subscription, SubscriptionId, SubscriptionRegistry, SubscriptionScope,
    },
};
use crate::{
    agent_registry::{AgentId, AgentRegistration, AgentRegistry},
    config::SystemConfig,
    timestamp::Timestamp,
};

/// Emitted after an agent is registered, when lifecycle events are enabled.
pub const AGENT_REGISTERED: &str = "system.agent.registered";
/// Emitted after an agent is unregistered, when lifecycle events are enabled.
pub const AGENT_UNREGISTERED: &str = "system.agent.unregistered";
/// Source recorded on events fired by the deferred emitter.
pub const DEFERRED_SOURCE: &str = "deferred";
const SYSTEM_SOURCE: &str = "system";

/// Result of one emit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmitReceipt {
    pub event_id: Uuid,
    /// Deliveries spawned for this event.
    pub matched: usize,
    /// Child events emitted from the declared handler entries.
    pub fanned_out: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStatistics {
    pub active_agents: usize,
    pub active_subscriptions: usize,
    pub events_emitted_total: u64,
    pub deliveries_total: u64,
    pub handler_faults_total: u64,
    pub pending_deferred: usize,
    pub in_flight_handlers: usize,
}

/// A handler that returned an error or panicked.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerFault {
    pub subscription_id: SubscriptionId,
    pub owner: Option<AgentId>,
    pub event_name: String,
    pub event_id: Uuid,
    pub message: String,
    pub panicked: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnfinishedHandler {
    pub subscription_id: SubscriptionId,
    pub owner: Option<AgentId>,
    pub event_name: String,
    pub running_for: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub cancelled_deferred: usize,
    pub completed_in_grace: usize,
    pub unfinished: Vec<UnfinishedHandler>,
}

struct InFlightDelivery {
    subscription_id: SubscriptionId,
    owner: Option<AgentId>,
    event_name: EventName,
    started_at: Instant,
}

#[derive(Default)]
struct Counters {
    events_emitted: AtomicU64,
    deliveries: AtomicU64,
    handler_faults: AtomicU64,
}

struct BusInner {
    subscriptions: SubscriptionRegistry,
    agents: AgentRegistry,
    deferred: DeferredEmitter,
    fault_sender: broadcast::Sender<HandlerFault>,
    in_flight: DashMap<u64, InFlightDelivery>,
    idle: Notify,
    next_delivery: AtomicU64,
    accepting: AtomicBool,
    counters: Counters,
    lifecycle_events: bool,
    default_source: String,
    shutdown_timeout: Duration,
}

/// # EventBus
///
/// Cloneable handle to one dispatcher. Clones share the same registry,
/// counters and deferred driver.
///
/// Construct inside a Tokio runtime: the deferred driver and every delivery
/// run as spawned tasks.
///
/// ```rust,no_run
/// use synapse::event_bus::EventBus;
/// use synapse::subscription::{handler_fn, SubscriptionScope};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = EventBus::new();
/// bus.subscribe(
///     "support.any",
///     handler_fn(|envelope| async move {
///         println!("ticket event: {}", envelope.name());
///         Ok(())
///     }),
///     SubscriptionScope::Global,
///     None,
/// )?;
/// bus.emit("support.tickets.new", synapse::payload! { "ticketId" => "T-001" })?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::from_config(&SystemConfig::default())
    }

    pub fn from_config(config: &SystemConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<BusInner>| {
            let weak = weak.clone();
            let sink: DeferredSink = Arc::new(move |task: DeferredTask| {
                if let Some(inner) = weak.upgrade() {
                    EventBus { inner }.emit_deferred(task);
                }
            });
            let (fault_sender, _) = broadcast::channel(config.bus.fault_channel_capacity.max(1));
            BusInner {
                subscriptions: SubscriptionRegistry::new(),
                agents: AgentRegistry::new(),
                deferred: DeferredEmitter::new(config.deferred.max_pending, sink),
                fault_sender,
                in_flight: DashMap::new(),
                idle: Notify::new(),
                next_delivery: AtomicU64::new(0),
                accepting: AtomicBool::new(true),
                counters: Counters::default(),
                lifecycle_events: config.bus.lifecycle_events,
                default_source: config.bus.default_source.clone(),
                shutdown_timeout: config.shutdown_timeout,
            }
        });
        Self { inner }
    }

    /// Emits `name` with `payload` and no declared handlers.
    pub fn emit(&self, name: &str, payload: Payload) -> EventResult<EmitReceipt> {
        self.emit_with_handlers(name, payload, &[])
    }

    /// Emits `name`, then one child event per entry of `handlers`, in order.
    ///
    /// Each child carries `merge(payload, entry.overrides)` and the trigger's
    /// instance scope unless the entry overrides the scope key itself.
    pub fn emit_with_handlers(
        &self,
        name: &str,
        payload: Payload,
        handlers: &[HandlerEntry],
    ) -> EventResult<EmitReceipt> {
        let envelope = EventEnvelope::builder(EventName::parse(name)?)
            .payload(payload)
            .source(self.inner.default_source.clone())
            .build();
        self.emit_envelope(envelope, handlers)
    }

    pub fn emit_envelope(
        &self,
        envelope: EventEnvelope,
        handlers: &[HandlerEntry],
    ) -> EventResult<EmitReceipt> {
        self.ensure_accepting()?;
        self.inner
            .counters
            .events_emitted
            .fetch_add(1, Ordering::Relaxed);
        debug_event("Emitting", &envelope);

        let envelope = Arc::new(envelope);
        let matched = self.dispatch(&envelope);
        let fanned_out = self.fan_out(
            envelope.payload(),
            envelope.source(),
            Some(envelope.id()),
            handlers,
        );

        Ok(EmitReceipt {
            event_id: envelope.id(),
            matched,
            fanned_out,
        })
    }

    /// Emits one child per entry and returns how many went out.
    ///
    /// A child that fails (shutdown starting partway through) is logged and
    /// skipped; children already emitted stay emitted.
    pub(crate) fn fan_out(
        &self,
        trigger: &Payload,
        source: &str,
        parent: Option<Uuid>,
        handlers: &[HandlerEntry],
    ) -> usize {
        let scope = instance::resolve(trigger);
        let mut emitted = 0;
        for entry in handlers {
            let merged = instance::propagate(
                scope.as_ref(),
                merge(trigger, &entry.overrides),
                &entry.overrides,
            );
            let mut builder = EventEnvelope::builder(entry.target.clone())
                .payload(merged)
                .source(source);
            if let Some(parent) = parent {
                builder = builder.parent(parent);
            }
            match self.emit_envelope(builder.build(), &[]) {
                Ok(_) => emitted += 1,
                Err(e) => warn!("fan-out to {} skipped: {}", entry.target, e),
            }
        }
        emitted
    }

    fn dispatch(&self, envelope: &Arc<EventEnvelope>) -> usize {
        let snapshot = self.inner.subscriptions.snapshot();
        let mut matched = 0;
        for subscription in snapshot.iter() {
            if !subscription.accepts(envelope) || !subscription.claim() {
                continue;
            }
            matched += 1;
            self.spawn_delivery(subscription.clone(), envelope.clone());
        }
        if matched == 0 {
            trace!("no subscribers for {}", envelope.name());
        }
        matched
    }

    fn spawn_delivery(&self, subscription: Arc<Subscription>, envelope: Arc<EventEnvelope>) {
        let delivery_id = self.inner.next_delivery.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.insert(
            delivery_id,
            InFlightDelivery {
                subscription_id: subscription.id(),
                owner: subscription.owner(),
                event_name: envelope.name().clone(),
                started_at: Instant::now(),
            },
        );
        let bus = self.clone();
        tokio::spawn(async move {
            bus.deliver(subscription, envelope).await;
            bus.finish_delivery(delivery_id);
        });
    }

    async fn deliver(&self, subscription: Arc<Subscription>, envelope: Arc<EventEnvelope>) {
        if !subscription.begin_delivery() {
            trace!(
                "subscription {} removed before delivery of {}",
                subscription.id(),
                envelope.name()
            );
            return;
        }
        if *subscription.scope() == SubscriptionScope::CallLocal {
            self.unsubscribe(subscription.id());
        }

        trace!(
            "delivering {} ({}) to subscription {}",
            envelope.name(),
            envelope.id(),
            subscription.id()
        );
        let outcome = AssertUnwindSafe(subscription.handler().handle(envelope.clone()))
            .catch_unwind()
            .await;
        self.inner
            .counters
            .deliveries
            .fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "handler for subscription {} failed on {}: {}",
                    subscription.id(),
                    envelope.name(),
                    e
                );
                self.report_fault(&subscription, &envelope, e.to_string(), false);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    "handler for subscription {} panicked on {}: {}",
                    subscription.id(),
                    envelope.name(),
                    message
                );
                self.report_fault(&subscription, &envelope, message, true);
            }
        }
    }

    fn finish_delivery(&self, delivery_id: u64) {
        self.inner.in_flight.remove(&delivery_id);
        if self.inner.in_flight.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }

    fn report_fault(
        &self,
        subscription: &Subscription,
        envelope: &EventEnvelope,
        message: String,
        panicked: bool,
    ) {
        self.inner
            .counters
            .handler_faults
            .fetch_add(1, Ordering::Relaxed);
        // no fault receivers is fine
        let _ = self.inner.fault_sender.send(HandlerFault {
            subscription_id: subscription.id(),
            owner: subscription.owner(),
            event_name: envelope.name().to_string(),
            event_id: envelope.id(),
            message,
            panicked,
            timestamp: Timestamp::now(),
        });
    }

    fn emit_deferred(&self, task: DeferredTask) {
        let id = task.id;
        let envelope = EventEnvelope::builder(task.name)
            .payload(task.payload)
            .source(DEFERRED_SOURCE)
            .build();
        if let Err(e) = self.emit_envelope(envelope, &[]) {
            warn!("deferred task {} not emitted: {}", id, e);
        }
    }

    /// Registers a handler for every event matching `pattern`.
    ///
    /// With an `owner`, the subscription is tied to that agent and removed
    /// when the agent is unregistered.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        scope: SubscriptionScope,
        owner: Option<AgentId>,
    ) -> EventResult<SubscriptionId> {
        self.ensure_accepting()?;
        let pattern = Pattern::parse(pattern)?;
        debug!("Subscribing {} ({:?}, owner {:?})", pattern, scope, owner);
        let subscription = Subscription::new(pattern, handler, scope, owner);
        match owner {
            Some(owner) => self
                .inner
                .agents
                .attach(owner, || self.inner.subscriptions.add(subscription)),
            None => Ok(self.inner.subscriptions.add(subscription)),
        }
    }

    /// Removes a subscription. Returns `false` when it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.inner.subscriptions.remove(id) {
            Some(subscription) => {
                if let Some(owner) = subscription.owner() {
                    self.inner.agents.detach(owner, id);
                }
                debug!("Unsubscribed {}", id);
                true
            }
            None => false,
        }
    }

    #[tracing::instrument(skip(self, metadata), level = "debug")]
    pub fn register_agent(&self, display_name: &str, metadata: Payload) -> EventResult<AgentId> {
        self.ensure_accepting()?;
        let id = self.inner.agents.register(display_name, metadata);
        info!("agent {} registered as {}", display_name, id);
        if self.inner.lifecycle_events {
            self.emit_lifecycle(AGENT_REGISTERED, id, display_name);
        }
        Ok(id)
    }

    /// Removes the agent and all of its subscriptions. No delivery to those
    /// subscriptions starts after this returns. Unknown ids return `None`.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn unregister_agent(&self, id: AgentId) -> Option<AgentRegistration> {
        let registration = self.inner.agents.unregister(id, &self.inner.subscriptions)?;
        info!("agent {} ({}) unregistered", registration.display_name, id);
        if self.inner.lifecycle_events && self.is_accepting() {
            self.emit_lifecycle(AGENT_UNREGISTERED, id, &registration.display_name);
        }
        Some(registration)
    }

    fn emit_lifecycle(&self, name: &str, id: AgentId, display_name: &str) {
        let mut payload = Payload::new();
        payload.insert("agent_id".to_string(), Value::String(id.to_string()));
        payload.insert(
            "display_name".to_string(),
            Value::String(display_name.to_string()),
        );
        let result = EventName::parse(name).and_then(|name| {
            let envelope = EventEnvelope::builder(name)
                .payload(payload)
                .source(SYSTEM_SOURCE)
                .build();
            self.emit_envelope(envelope, &[])
        });
        if let Err(e) = result {
            debug!("lifecycle event {} not emitted: {}", name, e);
        }
    }

    pub fn agent(&self, id: AgentId) -> Option<AgentRegistration> {
        self.inner.agents.get(id)
    }

    /// Schedules `name` to be emitted once, after a delay in `[min, max]`
    /// chosen by `strategy`.
    pub fn schedule(
        &self,
        name: &str,
        payload: Payload,
        min: Duration,
        max: Duration,
        strategy: &dyn DelayStrategy,
    ) -> EventResult<DeferredHandle> {
        self.ensure_accepting()?;
        let name = EventName::parse(name)?;
        self.inner
            .deferred
            .schedule(name, payload, min, max, strategy)
    }

    pub fn statistics(&self) -> BusStatistics {
        let counters = &self.inner.counters;
        BusStatistics {
            active_agents: self.inner.agents.len(),
            active_subscriptions: self.inner.subscriptions.len(),
            events_emitted_total: counters.events_emitted.load(Ordering::Relaxed),
            deliveries_total: counters.deliveries.load(Ordering::Relaxed),
            handler_faults_total: counters.handler_faults.load(Ordering::Relaxed),
            pending_deferred: self.inner.deferred.pending_count(),
            in_flight_handlers: self.inner.in_flight.len(),
        }
    }

    pub fn subscribe_faults(&self) -> FaultReceiver {
        FaultReceiver::new(self.inner.fault_sender.subscribe())
    }

    /// Waits until no handler is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Shuts down with the configured grace period.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_grace(self.inner.shutdown_timeout).await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn shutdown_with_grace(&self, grace: Duration) -> ShutdownReport {
        if self.inner.accepting.swap(false, Ordering::AcqRel) {
            info!("event bus shutting down");
        }
        let cancelled_deferred = self.inner.deferred.cancel_all();
        self.inner.deferred.close();

        let running_at_start = self.inner.in_flight.len();
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.is_empty() {
                break;
            }
            if timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let now = Instant::now();
        let unfinished: Vec<UnfinishedHandler> = self
            .inner
            .in_flight
            .iter()
            .map(|entry| UnfinishedHandler {
                subscription_id: entry.subscription_id,
                owner: entry.owner,
                event_name: entry.event_name.to_string(),
                running_for: now.duration_since(entry.started_at),
            })
            .collect();
        if !unfinished.is_empty() {
            warn!(
                "{} handlers still running after {:?} grace period",
                unfinished.len(),
                grace
            );
        }

        ShutdownReport {
            cancelled_deferred,
            completed_in_grace: running_at_start.saturating_sub(unfinished.len()),
            unfinished,
        }
    }

    pub(crate) fn ensure_accepting(&self) -> EventResult<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(EventError::ShutdownInProgress)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// `system.*` events are frequent and mostly uninteresting, so they go to
/// `trace`.
pub fn debug_event(prefix: &str, envelope: &EventEnvelope) {
    if envelope.name().root() == "system" {
        trace!("{} Event: {} {:?}", prefix, envelope.name(), envelope.payload());
    } else {
        debug!(
            "{} Event: {} ({}) {:?}",
            prefix,
            envelope.name(),
            envelope.id(),
            envelope.payload()
        );
    }
}

pub struct FaultReceiver {
    pub receiver: broadcast::Receiver<HandlerFault>,
}

impl FaultReceiver {
    pub fn new(receiver: broadcast::Receiver<HandlerFault>) -> Self {
        Self { receiver }
    }

    /// Receives the next fault. On lag the receiver skips to the newest
    /// faults and reports how many were missed.
    pub async fn recv(&mut self) -> EventResult<HandlerFault> {
        match self.receiver.recv().await {
            Ok(fault) => Ok(fault),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.receiver = self.receiver.resubscribe();
                Err(EventError::Lagged { count: n })
            }
            Err(e) => Err(EventError::ReceiveFailed {
                message: e.to_string(),
            }),
        }
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid event name '{name}': {reason}")]
    InvalidEventName { name: String, reason: String },

    #[error("Invalid delay range: min {min:?} is greater than max {max:?}")]
    InvalidDelayRange { min: Duration, max: Duration },

    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    #[error("Event bus is shutting down")]
    ShutdownInProgress,

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Delay {delay:?} puts the deadline beyond the clock's range")]
    DelayOverflow { delay: Duration },

    #[error("Too many pending deferred tasks (limit {limit})")]
    TooManyPendingTasks { limit: usize },

    #[error("Event lagged: {count}")]
    Lagged { count: u64 },

    #[error("Event Receive failed: {message}")]
    ReceiveFailed { message: String },
}

pub type EventResult<T> = Result<T, EventError>;
