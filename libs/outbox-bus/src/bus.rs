//! The outbox bus: typed subscriptions, middleware wiring, dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use outbox_core::{
    error_hook, ErrorHook, Event, EventHandler, EventStore, FailedEvent, OutboxError,
    OutboxMetrics, OutboxOptions, OutboxResult, PollingService,
};

use crate::middleware::{Middleware, MiddlewareContext, MiddlewarePipeline, Phase, Terminal};

/// Bus construction options.
pub struct BusConfig {
    /// Hook receiving operational and handler errors from the processing
    /// engine.
    pub on_error: ErrorHook,
    /// Adapter/polling options, shared with the storage adapter.
    pub options: OutboxOptions,
    /// Optional Prometheus instrumentation for the polling loop.
    pub metrics: Option<OutboxMetrics>,
}

impl BusConfig {
    pub fn new(on_error: ErrorHook) -> Self {
        Self {
            on_error,
            options: OutboxOptions::default(),
            metrics: None,
        }
    }

    pub fn with_options(mut self, options: OutboxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new(error_hook(|err| {
            tracing::error!(error = %err, "unhandled outbox error");
        }))
    }
}

struct Registration {
    /// Handler invoked by the dispatcher (a self-removing wrapper for
    /// one-shot listeners).
    handler: EventHandler,
    /// Caller-supplied handler: the removal token for `off`.
    original: EventHandler,
    once: bool,
}

struct BusShared {
    registry: RwLock<HashMap<String, Registration>>,
    pipeline: RwLock<MiddlewarePipeline>,
    on_error: ErrorHook,
}

/// In-process dispatcher over a storage adapter.
///
/// Routing is 1-to-1: each event type has at most one live handler, and a
/// second registration fails with [`OutboxError::DuplicateListener`].
/// Events whose type has no handler are acknowledged as a silent success.
pub struct OutboxBus<S: EventStore> {
    store: Arc<S>,
    shared: Arc<BusShared>,
    poller: PollingService<S>,
}

impl<S: EventStore> OutboxBus<S> {
    pub fn new(store: Arc<S>, config: BusConfig) -> Self {
        let shared = Arc::new(BusShared {
            registry: RwLock::new(HashMap::new()),
            pipeline: RwLock::new(MiddlewarePipeline::default()),
            on_error: config.on_error,
        });
        let mut poller = PollingService::new(store.clone(), config.options);
        if let Some(metrics) = config.metrics {
            poller = poller.with_metrics(metrics);
        }
        Self {
            store,
            shared,
            poller,
        }
    }

    /// The underlying storage adapter.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ---- emission ----------------------------------------------------

    /// Run the emit middleware chain for `event`, then persist it through
    /// the adapter. Returns `false` when a middleware dropped the event.
    pub async fn emit(&self, event: Event, tx: Option<&mut S::Tx>) -> OutboxResult<bool> {
        let published = self.emit_many(vec![event], tx).await?;
        Ok(published > 0)
    }

    /// Emit a batch: each event runs the middleware chain individually,
    /// then every surviving event is persisted in one atomic `publish`.
    /// Returns the number of events persisted. An empty input is a no-op
    /// and never reaches the adapter.
    pub async fn emit_many(
        &self,
        events: Vec<Event>,
        tx: Option<&mut S::Tx>,
    ) -> OutboxResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let pipeline = self.shared.pipeline.read().clone();
        let transactional = tx.is_some();
        let batch: Arc<parking_lot::Mutex<Vec<Event>>> =
            Arc::new(parking_lot::Mutex::new(Vec::with_capacity(events.len())));

        for event in events {
            let mut ctx = MiddlewareContext {
                phase: Phase::Emit,
                event,
                transactional,
            };
            let sink = batch.clone();
            let terminal: Box<Terminal> = Box::new(move |ctx| {
                let sink = sink.clone();
                let event = ctx.event.clone();
                Box::pin(async move {
                    sink.lock().push(event);
                    Ok(())
                })
            });
            let ran = pipeline
                .run(&mut ctx, terminal.as_ref())
                .await
                .map_err(middleware_error)?;
            if !ran {
                debug!(event_type = %ctx.event.event_type, "event dropped by emit middleware");
            }
        }

        let to_publish = std::mem::take(&mut *batch.lock());
        if to_publish.is_empty() {
            return Ok(0);
        }
        let published = to_publish.len();
        self.store.publish(to_publish, tx).await?;
        Ok(published)
    }

    // ---- subscriptions -----------------------------------------------

    /// Register the single handler for `event_type`.
    pub fn on(&self, event_type: impl Into<String>, handler: EventHandler) -> OutboxResult<()> {
        self.register(event_type.into(), handler, false)
    }

    /// Alias for [`OutboxBus::on`].
    pub fn add_listener(
        &self,
        event_type: impl Into<String>,
        handler: EventHandler,
    ) -> OutboxResult<()> {
        self.on(event_type, handler)
    }

    /// Register a handler that removes itself after its first invocation.
    /// The original handler reference removes it via [`OutboxBus::off`].
    pub fn once(&self, event_type: impl Into<String>, handler: EventHandler) -> OutboxResult<()> {
        self.register(event_type.into(), handler, true)
    }

    /// Atomically register the same handler for several types. If any type
    /// already has a handler, nothing is registered.
    pub fn subscribe(
        &self,
        event_types: &[&str],
        handler: EventHandler,
    ) -> OutboxResult<()> {
        let mut registry = self.shared.registry.write();
        for event_type in event_types {
            if registry.contains_key(*event_type) {
                return Err(OutboxError::DuplicateListener {
                    event_type: event_type.to_string(),
                });
            }
        }
        for event_type in event_types {
            registry.insert(
                event_type.to_string(),
                Registration {
                    handler: handler.clone(),
                    original: handler.clone(),
                    once: false,
                },
            );
        }
        Ok(())
    }

    /// Remove the handler for `event_type` if `handler` is the one
    /// registered (by reference identity). Returns whether a handler was
    /// removed.
    pub fn off(&self, event_type: &str, handler: &EventHandler) -> bool {
        let mut registry = self.shared.registry.write();
        let matches = registry
            .get(event_type)
            .map(|registration| Arc::ptr_eq(&registration.original, handler))
            .unwrap_or(false);
        if matches {
            registry.remove(event_type);
        }
        matches
    }

    /// Alias for [`OutboxBus::off`].
    pub fn remove_listener(&self, event_type: &str, handler: &EventHandler) -> bool {
        self.off(event_type, handler)
    }

    /// Remove every handler, or only the one for `event_type`.
    pub fn remove_all_listeners(&self, event_type: Option<&str>) {
        let mut registry = self.shared.registry.write();
        match event_type {
            Some(event_type) => {
                registry.remove(event_type);
            }
            None => registry.clear(),
        }
    }

    /// Future resolving with the next event of `event_type`, or
    /// [`OutboxError::Timeout`] after `timeout`. The internal one-shot
    /// handler is removed on both resolution and expiry.
    pub async fn wait_for(
        &self,
        event_type: impl Into<String>,
        timeout: Duration,
    ) -> OutboxResult<Event> {
        let event_type = event_type.into();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let slot = Arc::new(parking_lot::Mutex::new(Some(tx)));

        let sender = slot.clone();
        let handler: EventHandler = Arc::new(move |event| {
            let sender = sender.clone();
            async move {
                if let Some(tx) = sender.lock().take() {
                    let _ = tx.send(event);
                }
                Ok(())
            }
            .boxed()
        });
        self.register(event_type.clone(), handler.clone(), true)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => {
                // The one-shot handler was removed before it fired.
                Err(OutboxError::Timeout {
                    event_type,
                    waited: timeout,
                })
            }
            Err(_) => {
                self.off(&event_type, &handler);
                Err(OutboxError::Timeout {
                    event_type,
                    waited: timeout,
                })
            }
        }
    }

    // ---- introspection -----------------------------------------------

    /// Number of event types with a live handler.
    pub fn subscription_count(&self) -> usize {
        self.shared.registry.read().len()
    }

    /// 1 if `event_type` has a handler, 0 otherwise.
    pub fn listener_count(&self, event_type: &str) -> usize {
        usize::from(self.shared.registry.read().contains_key(event_type))
    }

    /// Event types with a live handler.
    pub fn event_names(&self) -> Vec<String> {
        self.shared.registry.read().keys().cloned().collect()
    }

    /// The caller-supplied handler for `event_type`, if one is registered.
    pub fn get_listener(&self, event_type: &str) -> Option<EventHandler> {
        self.shared
            .registry
            .read()
            .get(event_type)
            .map(|registration| registration.original.clone())
    }

    // ---- middleware --------------------------------------------------

    /// Append a middleware to the pipeline. Both phases run the full
    /// stack; middlewares branch on `ctx.phase` as needed.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.shared.pipeline.write().push(middleware);
    }

    /// Append several middlewares in order.
    pub fn add_middlewares(&self, middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>) {
        let mut pipeline = self.shared.pipeline.write();
        for middleware in middlewares {
            pipeline.push(middleware);
        }
    }

    // ---- failed-event management -------------------------------------

    /// Up to the 100 most recent dead-lettered events, newest first.
    /// Fails with [`OutboxError::Unsupported`] when the adapter lacks the
    /// capability.
    pub async fn failed_events(&self) -> OutboxResult<Vec<FailedEvent>> {
        self.store.list_failed(100).await
    }

    /// Re-queue dead-lettered events with a fresh retry budget.
    pub async fn retry_events(&self, ids: &[Uuid]) -> OutboxResult<()> {
        self.store.retry_events(ids).await
    }

    // ---- lifecycle ---------------------------------------------------

    /// Start the processing engine with the bus dispatcher as handler.
    /// Idempotent while running.
    pub async fn start(&self) {
        let handler = dispatcher(self.shared.clone());
        self.poller.start(handler, self.shared.on_error.clone()).await;
    }

    /// Stop the processing engine, awaiting outstanding dispatches.
    /// Events not yet claimed stay `Created`.
    pub async fn stop(&self) {
        self.poller.stop().await;
    }

    fn register(
        &self,
        event_type: String,
        handler: EventHandler,
        once: bool,
    ) -> OutboxResult<()> {
        let mut registry = self.shared.registry.write();
        if registry.contains_key(&event_type) {
            return Err(OutboxError::DuplicateListener { event_type });
        }
        let registration = if once {
            Registration {
                handler: once_wrapper(
                    Arc::downgrade(&self.shared),
                    event_type.clone(),
                    handler.clone(),
                ),
                original: handler,
                once: true,
            }
        } else {
            Registration {
                handler: handler.clone(),
                original: handler,
                once: false,
            }
        };
        registry.insert(event_type, registration);
        Ok(())
    }
}

/// Convert a pipeline error back into the outbox taxonomy, preserving
/// typed errors raised inside the chain.
fn middleware_error(err: anyhow::Error) -> OutboxError {
    match err.downcast::<OutboxError>() {
        Ok(err) => err,
        Err(err) => OutboxError::Other(err),
    }
}

/// Wrap a one-shot handler: the first invocation deregisters it before
/// delegating, and concurrent deliveries of the same type collapse to a
/// single invocation.
fn once_wrapper(
    shared: Weak<BusShared>,
    event_type: String,
    original: EventHandler,
) -> EventHandler {
    let fired = Arc::new(AtomicBool::new(false));
    Arc::new(move |event| {
        if fired.swap(true, Ordering::SeqCst) {
            return futures::future::ready(Ok(())).boxed();
        }
        if let Some(shared) = shared.upgrade() {
            let mut registry = shared.registry.write();
            let matches = registry
                .get(&event_type)
                .map(|registration| {
                    registration.once && Arc::ptr_eq(&registration.original, &original)
                })
                .unwrap_or(false);
            if matches {
                registry.remove(&event_type);
            }
        }
        original(event)
    })
}

/// The handler the bus hands to the polling service: run the
/// handler-phase middleware chain, then route to the registered listener
/// by exact type match. Unhandled types are a silent success.
fn dispatcher(shared: Arc<BusShared>) -> EventHandler {
    Arc::new(move |event: Event| {
        let shared = shared.clone();
        async move {
            let pipeline = shared.pipeline.read().clone();
            let mut ctx = MiddlewareContext {
                phase: Phase::Handler,
                event,
                transactional: false,
            };
            let lookup = shared.clone();
            let terminal: Box<Terminal> = Box::new(move |ctx| {
                let handler = lookup
                    .registry
                    .read()
                    .get(&ctx.event.event_type)
                    .map(|registration| registration.handler.clone());
                match handler {
                    Some(handler) => handler(ctx.event.clone()),
                    None => {
                        trace!(
                            event_type = %ctx.event.event_type,
                            "no listener registered, acknowledging event"
                        );
                        futures::future::ready(Ok(())).boxed()
                    }
                }
            });
            let ran = pipeline.run(&mut ctx, terminal.as_ref()).await?;
            if !ran {
                debug!(
                    event_type = %ctx.event.event_type,
                    "event dropped by handler middleware"
                );
            }
            Ok(())
        }
        .boxed()
    })
}
