//! # Transactional Outbox Processing Engine
//!
//! Core of a transactional outbox event bus: callers persist domain events
//! atomically alongside their business-state writes, and a background
//! processor reliably delivers each event **at least once** to in-process
//! handlers.
//!
//! ## How it works
//!
//! 1. A caller publishes events through a storage adapter, optionally
//!    enlisting the writes in its own transaction so business write and
//!    event write commit atomically
//! 2. Events are stored with status `Created` and a due instant
//! 3. The polling service claims due events (transitioning them to
//!    `Active` with a visibility deadline, safe against competing workers)
//!    and hands each one to the handler
//! 4. Success marks the event `Completed`; a rejection schedules a retry
//!    with exponential backoff, or dead-letters the event (`Failed`) once
//!    the retry budget is spent
//!
//! This guarantees at-least-once delivery even if the process crashes
//! mid-dispatch: an event stuck past its visibility deadline becomes
//! claimable again on a later tick. Handlers must be idempotent.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use outbox_core::{
//!     error_hook, event_handler, Event, EventStore, InMemoryStore, OutboxOptions,
//!     PollingService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!
//!     // Publish an event (pass a transaction token to co-commit with a
//!     // business write).
//!     let event = Event::new("user.created", serde_json::json!({ "user_id": 7 }));
//!     store.publish(vec![event], None).await?;
//!
//!     // Drive delivery in the background.
//!     let poller = PollingService::new(store.clone(), OutboxOptions::default());
//!     poller
//!         .start(
//!             event_handler(|event| async move {
//!                 println!("delivered {}", event.event_type);
//!                 Ok(())
//!             }),
//!             error_hook(|err| eprintln!("outbox error: {err}")),
//!         )
//!         .await;
//!
//!     // ... later: cancel the next tick and await the in-flight batch.
//!     poller.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! Concrete backends implement [`EventStore`]; [`InMemoryStore`] is the
//! canonical reference used by the conformance suite.

pub mod collector;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod memory;
pub mod metrics;
pub mod poller;
pub mod retry;
pub mod store;

// Re-export main types for convenience
pub use collector::{
    current_collector, with_collector, BatchCollector, SharedCollector, DEFAULT_COLLECTOR_CAPACITY,
};
pub use config::OutboxOptions;
pub use error::{format_error_message, report_event_error, OutboxError, OutboxResult};
pub use event::{Event, EventStatus, FailedEvent, StoredEvent};
pub use handler::{error_hook, event_handler, ErrorHook, EventHandler};
pub use memory::InMemoryStore;
pub use metrics::OutboxMetrics;
pub use poller::PollingService;
pub use retry::RetryPolicy;
pub use store::EventStore;
