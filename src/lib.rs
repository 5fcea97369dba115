//! # synapse
//!
//! Namespace-scoped, pattern-matched event dispatch for orchestrating
//! autonomous agents. See [`event`] for the runtime and
//! [`event_bus::EventBus`] for the entry point.

pub mod agent_registry;
pub mod config;
pub mod error;
pub mod event;
pub mod timestamp;

// Re-exports
pub use error::*;
pub use event::*;

#[cfg(test)]
#[ctor::ctor]
fn init_tests() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
