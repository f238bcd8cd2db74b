//! Handler and error-hook callback types.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::OutboxError;
use crate::event::Event;

/// Async event handler invoked by the dispatcher for each claimed event.
///
/// A handler rejection puts the event on its retry schedule; success marks
/// it completed. The `Arc` identity doubles as the removal token for
/// listener deregistration.
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook receiving operational and handler errors from the processing
/// engine. Must not block.
pub type ErrorHook = Arc<dyn Fn(OutboxError) + Send + Sync>;

/// Adapt an async closure into an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Adapt a closure into an [`ErrorHook`].
pub fn error_hook<F>(f: F) -> ErrorHook
where
    F: Fn(OutboxError) + Send + Sync + 'static,
{
    Arc::new(f)
}
