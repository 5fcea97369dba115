//! # Event Runtime
//!
//! Namespace-scoped publish/subscribe for agent orchestration. Producers emit
//! named events with structured payloads; subscribers react without the
//! producer blocking on them or knowing who they are.
//!
//! ## Architecture Overview
//!
//! - **namespace**: event names, patterns and the `any` wildcard matcher
//! - **subscription**: typed handlers and the copy-on-write registry
//! - **payload**: payload values and the merge rule
//! - **instance**: per-call instance scope tagging
//! - **deferred**: bounded-delay continuations
//! - **event_bus**: the dispatcher tying the above together
//! - **gate**: judgment-driven conditional fan-out
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────┐  emit   ┌──────────┐ snapshot ┌──────────────┐
//! │ Producer │────────▶│ EventBus │─────────▶│ Subscriptions│
//! └──────────┘         └────┬─────┘          └──────┬───────┘
//!                           │ fan-out               │ spawn per match
//!                           ▼                       ▼
//!                     child events            ┌──────────┐
//!                     (merged payloads)       │ Handlers │
//!                                             └──────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use synapse::envelope::HandlerEntry;
//! use synapse::event_bus::EventBus;
//! use synapse::payload;
//! use synapse::subscription::{handler_fn, SubscriptionScope};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = EventBus::new();
//! let triage = bus.register_agent("triage", payload! {})?;
//! bus.subscribe(
//!     "support.any",
//!     handler_fn(|envelope| async move {
//!         println!("{} {:?}", envelope.name(), envelope.payload());
//!         Ok(())
//!     }),
//!     SubscriptionScope::Global,
//!     Some(triage),
//! )?;
//!
//! bus.emit_with_handlers(
//!     "support.tickets.new",
//!     payload! { "ticketId" => "T-001" },
//!     &[HandlerEntry::new("support.tickets.triage", payload! { "queue" => "billing" })?],
//! )?;
//!
//! bus.unregister_agent(triage);
//! bus.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod deferred;
pub mod envelope;
pub mod event_bus;
pub mod gate;
pub mod instance;
pub mod namespace;
pub mod payload;
pub mod subscription;
