mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use common::EventCollector;
use synapse::{
    agent_registry::AgentState,
    config::SystemConfig,
    event_bus::{EventBus, AGENT_REGISTERED, AGENT_UNREGISTERED},
    payload,
    payload::{Payload, Value},
    subscription::{handler_fn, SubscriptionScope},
};

fn counter(bus: &EventBus, pattern: &str, owner: synapse::agent_registry::AgentId) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    bus.subscribe(
        pattern,
        handler_fn(move |_| {
            let count = count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        SubscriptionScope::Global,
        Some(owner),
    )
    .unwrap();
    count
}

#[tokio::test]
async fn test_register_then_unregister_restores_subscriptions() {
    let bus = EventBus::new();
    let before = bus.statistics().active_subscriptions;

    let agent = bus
        .register_agent("triage", payload! { "team" => "support" })
        .unwrap();
    let count = counter(&bus, "support.any", agent);
    counter(&bus, "billing.any", agent);
    assert_eq!(bus.statistics().active_subscriptions, before + 2);
    assert_eq!(bus.agent(agent).unwrap().subscriptions.len(), 2);

    let registration = bus.unregister_agent(agent).unwrap();
    assert_eq!(registration.state, AgentState::Unregistered);
    assert_eq!(registration.subscriptions.len(), 2);
    assert_eq!(bus.statistics().active_subscriptions, before);
    assert_eq!(bus.statistics().active_agents, 0);

    bus.emit("support.tickets.new", Payload::new()).unwrap();
    bus.wait_idle().await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unregister_stops_deliveries_not_yet_started() {
    let bus = EventBus::new();
    let agent = bus.register_agent("triage", Payload::new()).unwrap();
    let count = counter(&bus, "support.any", agent);

    // spawned but not yet polled on the current-thread runtime
    let receipt = bus.emit("support.tickets.new", Payload::new()).unwrap();
    assert_eq!(receipt.matched, 1);
    bus.unregister_agent(agent);
    bus.wait_idle().await;

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(bus.statistics().deliveries_total, 0);
}

#[tokio::test]
async fn test_unregister_unknown_agent_is_noop() {
    let bus = EventBus::new();
    let agent = bus.register_agent("triage", Payload::new()).unwrap();
    assert!(bus.unregister_agent(agent).is_some());
    assert!(bus.unregister_agent(agent).is_none());
}

#[tokio::test]
async fn test_subscribe_after_unregister_fails() {
    let bus = EventBus::new();
    let agent = bus.register_agent("triage", Payload::new()).unwrap();
    bus.unregister_agent(agent);

    let result = bus.subscribe(
        "support.any",
        handler_fn(|_| async { Ok(()) }),
        SubscriptionScope::Global,
        Some(agent),
    );
    assert!(result.is_err());
    assert_eq!(bus.statistics().active_subscriptions, 0);
}

#[tokio::test]
async fn test_unsubscribe_detaches_from_agent() {
    let bus = EventBus::new();
    let agent = bus.register_agent("triage", Payload::new()).unwrap();
    let id = bus
        .subscribe(
            "support.any",
            handler_fn(|_| async { Ok(()) }),
            SubscriptionScope::Global,
            Some(agent),
        )
        .unwrap();

    assert!(bus.unsubscribe(id));
    assert!(bus.agent(agent).unwrap().subscriptions.is_empty());
}

#[tokio::test]
async fn test_lifecycle_events() {
    let bus = EventBus::new();
    let lifecycle = EventCollector::global(&bus, "system.agent.any");

    let agent = bus.register_agent("triage", Payload::new()).unwrap();
    bus.unregister_agent(agent);
    bus.wait_idle().await;

    let mut events = lifecycle.events().await;
    events.sort_by_key(|e| e.timestamp());
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].name().as_str(), AGENT_REGISTERED);
    assert_eq!(events[1].name().as_str(), AGENT_UNREGISTERED);
    for event in &events {
        assert_eq!(event.payload()["agent_id"], Value::String(agent.to_string()));
        assert_eq!(event.payload()["display_name"], Value::from("triage"));
        assert_eq!(event.source(), "system");
    }
}

#[tokio::test]
async fn test_lifecycle_events_can_be_disabled() {
    let mut config = SystemConfig::default();
    config.bus.lifecycle_events = false;
    let bus = EventBus::from_config(&config);
    let lifecycle = EventCollector::global(&bus, "system.any");

    let agent = bus.register_agent("triage", Payload::new()).unwrap();
    bus.unregister_agent(agent);
    bus.wait_idle().await;

    assert_eq!(lifecycle.len().await, 0);
    assert_eq!(bus.statistics().events_emitted_total, 0);
}
