use std::sync::Arc;

use synapse::{
    envelope::EventEnvelope,
    event_bus::EventBus,
    subscription::{handler_fn, SubscriptionId, SubscriptionScope},
};
use tokio::sync::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Records every envelope delivered to one subscription.
pub struct EventCollector {
    pub id: SubscriptionId,
    events: Arc<Mutex<Vec<Arc<EventEnvelope>>>>,
}

#[allow(dead_code)]
impl EventCollector {
    pub fn global(bus: &EventBus, pattern: &str) -> Self {
        Self::with_scope(bus, pattern, SubscriptionScope::Global)
    }

    pub fn with_scope(bus: &EventBus, pattern: &str, scope: SubscriptionScope) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let id = bus
            .subscribe(
                pattern,
                handler_fn(move |envelope| {
                    let events = events_clone.clone();
                    async move {
                        events.lock().await.push(envelope);
                        Ok(())
                    }
                }),
                scope,
                None,
            )
            .unwrap();
        Self { id, events }
    }

    pub async fn events(&self) -> Vec<Arc<EventEnvelope>> {
        self.events.lock().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}
