use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, sync::Arc};
use uuid::Uuid;

use crate::event::{
    event_bus::{EventError, EventResult},
    payload::Payload,
    subscription::{SubscriptionId, SubscriptionRegistry},
};
use crate::timestamp::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AgentState {
    Registered,
    Unregistered,
}

#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub id: AgentId,
    pub display_name: String,
    pub metadata: Payload,
    pub subscriptions: HashSet<SubscriptionId>,
    pub state: AgentState,
    pub registered_at: Timestamp,
}

/// Table of live agents and the subscriptions they own.
///
/// Attaching a subscription holds the agent's map entry while the
/// subscription is added, and unregistering removes that entry before it
/// drops the agent's subscriptions. Either the attach sees no agent and fails,
/// or its subscription is swept by the unregister.
pub struct AgentRegistry {
    agents: Arc<DashMap<AgentId, AgentRegistration>>,
}

impl Clone for AgentRegistry {
    fn clone(&self) -> Self {
        Self {
            agents: self.agents.clone(),
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
        }
    }

    #[tracing::instrument(skip(self, metadata), level = "debug")]
    pub fn register(&self, display_name: &str, metadata: Payload) -> AgentId {
        let id = AgentId::new();
        self.agents.insert(
            id,
            AgentRegistration {
                id,
                display_name: display_name.to_string(),
                metadata,
                subscriptions: HashSet::new(),
                state: AgentState::Registered,
                registered_at: Timestamp::now(),
            },
        );
        id
    }

    /// Removes the agent and every subscription it owns. Unknown ids return
    /// `None`.
    #[tracing::instrument(skip(self, subscriptions), level = "debug")]
    pub fn unregister(
        &self,
        id: AgentId,
        subscriptions: &SubscriptionRegistry,
    ) -> Option<AgentRegistration> {
        let (_, mut registration) = self.agents.remove(&id)?;
        let removed = subscriptions.remove_all_for_owner(id);
        tracing::debug!(
            "agent {} released {} subscriptions",
            registration.display_name,
            removed.len()
        );
        registration.state = AgentState::Unregistered;
        Some(registration)
    }

    /// Runs `add` while holding the owner's entry and records the id it
    /// returns.
    pub fn attach<F>(&self, owner: AgentId, add: F) -> EventResult<SubscriptionId>
    where
        F: FnOnce() -> SubscriptionId,
    {
        let mut registration =
            self.agents
                .get_mut(&owner)
                .ok_or_else(|| EventError::AgentNotFound {
                    agent_id: owner.to_string(),
                })?;
        let id = add();
        registration.subscriptions.insert(id);
        Ok(id)
    }

    pub fn detach(&self, owner: AgentId, subscription: SubscriptionId) {
        if let Some(mut registration) = self.agents.get_mut(&owner) {
            registration.subscriptions.remove(&subscription);
        }
    }

    pub fn get(&self, id: AgentId) -> Option<AgentRegistration> {
        self.agents.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        namespace::Pattern,
        subscription::{handler_fn, Subscription, SubscriptionScope},
    };
    use crate::payload;

    fn owned(owner: AgentId) -> Subscription {
        Subscription::new(
            Pattern::parse("support.any").unwrap(),
            handler_fn(|_| async { Ok(()) }),
            SubscriptionScope::Global,
            Some(owner),
        )
    }

    #[test]
    fn test_register_agent() {
        let registry = AgentRegistry::new();
        let id = registry.register("triage", payload! { "team" => "support" });

        let registration = registry.get(id).unwrap();
        assert_eq!(registration.display_name, "triage");
        assert_eq!(registration.state, AgentState::Registered);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_attach_and_unregister() {
        let registry = AgentRegistry::new();
        let subscriptions = SubscriptionRegistry::new();
        let id = registry.register("triage", Payload::new());

        let sub_id = registry
            .attach(id, || subscriptions.add(owned(id)))
            .unwrap();
        assert!(registry.get(id).unwrap().subscriptions.contains(&sub_id));
        assert_eq!(subscriptions.len(), 1);

        let registration = registry.unregister(id, &subscriptions).unwrap();
        assert_eq!(registration.state, AgentState::Unregistered);
        assert!(subscriptions.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_attach_unknown_owner() {
        let registry = AgentRegistry::new();
        let subscriptions = SubscriptionRegistry::new();
        let unknown = AgentId::new();

        let result = registry.attach(unknown, || subscriptions.add(owned(unknown)));
        assert!(matches!(result, Err(EventError::AgentNotFound { .. })));
        assert!(subscriptions.is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = AgentRegistry::new();
        let subscriptions = SubscriptionRegistry::new();
        let id = registry.register("triage", Payload::new());

        assert!(registry.unregister(id, &subscriptions).is_some());
        assert!(registry.unregister(id, &subscriptions).is_none());
    }

    #[test]
    fn test_detach() {
        let registry = AgentRegistry::new();
        let subscriptions = SubscriptionRegistry::new();
        let id = registry.register("triage", Payload::new());
        let sub_id = registry
            .attach(id, || subscriptions.add(owned(id)))
            .unwrap();

        registry.detach(id, sub_id);
        assert!(registry.get(id).unwrap().subscriptions.is_empty());
    }
}
