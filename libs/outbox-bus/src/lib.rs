//! # Outbox Event Bus
//!
//! In-process dispatcher over a transactional outbox: callers emit typed
//! events, optionally inside their own storage transaction, and registered
//! handlers receive them at least once via the background processor from
//! `outbox-core`.
//!
//! Routing is 1-to-1: each event type has at most one live handler. On top
//! of that sit `once` listeners, `wait_for` futures, and an onion-style
//! middleware pipeline around both the emit and dispatch paths.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use outbox_bus::{BusConfig, OutboxBus};
//! use outbox_core::{error_hook, event_handler, Event, InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let bus = OutboxBus::new(
//!         store,
//!         BusConfig::new(error_hook(|err| eprintln!("outbox error: {err}"))),
//!     );
//!
//!     bus.on(
//!         "user.created",
//!         event_handler(|event| async move {
//!             println!("welcome, {}", event.payload["username"]);
//!             Ok(())
//!         }),
//!     )?;
//!
//!     bus.start().await;
//!     bus.emit(
//!         Event::new("user.created", serde_json::json!({ "username": "alice" })),
//!         None,
//!     )
//!     .await?;
//!
//!     // ... later
//!     bus.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod middleware;

// Re-export main types for convenience
pub use bus::{BusConfig, OutboxBus};
pub use middleware::{Middleware, MiddlewareContext, MiddlewarePipeline, Next, Phase, Terminal};
