//! # Subscription Registry
//!
//! Subscriptions pair a [`Pattern`] with a typed handler. The registry is read
//! on every emit and written only on subscribe/unsubscribe, so it is kept as
//! an immutable vector behind an [`ArcSwap`]: readers load a snapshot without
//! locking, writers serialize on a mutex and publish a new vector.
//!
//! A removed subscription is also deactivated in place. Deliveries that were
//! spawned from an older snapshot check the flag before running the handler,
//! which is what makes unsubscribe and agent teardown take effect for
//! deliveries that have not started yet.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{envelope::EventEnvelope, instance::InstanceScope, namespace::Pattern};
use crate::agent_registry::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which envelopes a subscription receives among those its pattern matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Every matching envelope.
    Global,
    /// Only envelopes tagged with this instance scope.
    InstanceLocal(InstanceScope),
    /// The first matching envelope, after which the subscription removes itself.
    CallLocal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Handler failed: {message}")]
    Failed { message: String },
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        HandlerError::Failed {
            message: message.into(),
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> HandlerResult;
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> HandlerResult {
        (self.0)(envelope).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
///
/// ```rust
/// use synapse::subscription::handler_fn;
///
/// let handler = handler_fn(|envelope| async move {
///     tracing::info!("received {}", envelope.name());
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SubscriptionState {
    Active,
    Removed,
}

const ACTIVE: u8 = 0;
const CLAIMED: u8 = 1;
const REMOVED: u8 = 2;

pub struct Subscription {
    id: SubscriptionId,
    pattern: Pattern,
    handler: Arc<dyn EventHandler>,
    scope: SubscriptionScope,
    owner: Option<AgentId>,
    state: AtomicU8,
}

impl Subscription {
    pub fn new(
        pattern: Pattern,
        handler: Arc<dyn EventHandler>,
        scope: SubscriptionScope,
        owner: Option<AgentId>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            pattern,
            handler,
            scope,
            owner,
            state: AtomicU8::new(ACTIVE),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    pub fn scope(&self) -> &SubscriptionScope {
        &self.scope
    }

    pub fn owner(&self) -> Option<AgentId> {
        self.owner
    }

    pub fn state(&self) -> SubscriptionState {
        match self.state.load(Ordering::Acquire) {
            REMOVED => SubscriptionState::Removed,
            _ => SubscriptionState::Active,
        }
    }

    /// Pattern and scope filter for one envelope.
    pub fn accepts(&self, envelope: &EventEnvelope) -> bool {
        if self.state.load(Ordering::Acquire) != ACTIVE {
            return false;
        }
        if !self.pattern.matches(envelope.name()) {
            return false;
        }
        match &self.scope {
            SubscriptionScope::InstanceLocal(scope) => envelope.instance_scope() == Some(scope),
            SubscriptionScope::Global | SubscriptionScope::CallLocal => true,
        }
    }

    /// Reserves this subscription for one delivery. Only a call-local
    /// subscription can be claimed once; the rest always succeed.
    pub(crate) fn claim(&self) -> bool {
        match self.scope {
            SubscriptionScope::CallLocal => self
                .state
                .compare_exchange(ACTIVE, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            _ => true,
        }
    }

    /// Checked by the delivery task right before the handler runs.
    pub(crate) fn begin_delivery(&self) -> bool {
        match self.scope {
            SubscriptionScope::CallLocal => self
                .state
                .compare_exchange(CLAIMED, REMOVED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            _ => self.state.load(Ordering::Acquire) == ACTIVE,
        }
    }

    pub(crate) fn mark_removed(&self) {
        self.state.store(REMOVED, Ordering::Release);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("scope", &self.scope)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}

pub struct SubscriptionRegistry {
    entries: ArcSwap<Vec<Arc<Subscription>>>,
    write_lock: Mutex<()>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn add(&self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id();
        let subscription = Arc::new(subscription);
        self.update(|entries| entries.push(subscription));
        id
    }

    /// Removes and deactivates `id`. Missing ids are ignored.
    pub fn remove(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let mut removed = None;
        self.update(|entries| {
            if let Some(position) = entries.iter().position(|s| s.id() == id) {
                removed = Some(entries.remove(position));
            }
        });
        if let Some(subscription) = &removed {
            subscription.mark_removed();
        }
        removed
    }

    pub fn remove_all_for_owner(&self, owner: AgentId) -> Vec<Arc<Subscription>> {
        let mut removed = Vec::new();
        self.update(|entries| {
            entries.retain(|s| {
                if s.owner() == Some(owner) {
                    removed.push(s.clone());
                    false
                } else {
                    true
                }
            });
        });
        for subscription in &removed {
            subscription.mark_removed();
        }
        removed
    }

    /// Consistent view for one dispatch pass.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Subscription>>> {
        self.entries.load_full()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.entries.load().iter().find(|s| s.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Vec<Arc<Subscription>>),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = Vec::clone(&self.entries.load());
        mutate(&mut next);
        self.entries.store(Arc::new(next));
    }
}
