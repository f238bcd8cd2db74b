//! # Outbox Publisher
//!
//! Forwarder template for relaying outbox events to an external broker.
//!
//! The bus delivers events at least once to in-process handlers; a
//! forwarder is the handler that pushes them on to Kafka, NATS, or any
//! other transport. This crate supplies the plumbing every forwarder
//! needs (bounded buffering, batch assembly, bounded concurrency, and
//! per-batch retries) so that a concrete integration only implements
//! [`Forwarder::forward`].
//!
//! Delivery outcomes flow back to the outbox: the bus-compatible handler
//! resolves only once its event's batch has been forwarded, so a broker
//! outage re-queues events through the normal retry schedule instead of
//! losing them. A full buffer rejects the handler with backpressure, which
//! likewise re-queues the event.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use outbox_core::Event;
//! use outbox_publisher::{BufferedPublisher, Forwarder, PublisherOptions};
//!
//! struct LogForwarder;
//!
//! #[async_trait]
//! impl Forwarder for LogForwarder {
//!     async fn forward(&self, events: &[Event]) -> anyhow::Result<()> {
//!         for event in events {
//!             println!("forwarding {}", event.event_type);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let publisher = Arc::new(BufferedPublisher::new(
//!         LogForwarder,
//!         PublisherOptions::default(),
//!     ));
//!     publisher.start().await;
//!
//!     // Register on the bus:
//!     //   bus.on("order.placed", publisher.clone().handler())
//!     let handler = publisher.clone().handler();
//!     handler(Event::new("order.placed", serde_json::json!({}))).await?;
//!
//!     publisher.stop().await;
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use outbox_core::{format_error_message, Event, EventHandler, OutboxError, RetryPolicy};

/// Transport-specific delivery of a batch of events.
///
/// Implementations should be idempotent: a batch may be forwarded again
/// after a crash or a partially failed retry.
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    async fn forward(&self, events: &[Event]) -> anyhow::Result<()>;
}

/// Buffering and delivery options.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    /// Maximum events per forwarded batch.
    pub max_batch_size: usize,
    /// Maximum buffered events before enqueue reports backpressure.
    pub max_buffered: usize,
    /// Linger before flushing a partial batch.
    pub flush_interval: Duration,
    /// Maximum concurrent forward calls.
    pub concurrency: usize,
    /// Per-batch retry policy.
    pub retry: RetryPolicy,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            max_buffered: 1000,
            flush_interval: Duration::from_millis(100),
            concurrency: 4,
            retry: RetryPolicy {
                max_retries: 3,
                base_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(5),
                jitter: false,
            },
        }
    }
}

struct Pending {
    event: Event,
    done: oneshot::Sender<anyhow::Result<()>>,
}

/// Buffering forwarder driver.
///
/// Events enter through [`BufferedPublisher::deliver`] (or the
/// bus-compatible [`BufferedPublisher::handler`]), accumulate in a bounded
/// buffer, and leave in batches assembled by a background flusher, either
/// on a linger interval or as soon as a full batch is ready.
pub struct BufferedPublisher<F: Forwarder> {
    forwarder: Arc<F>,
    options: PublisherOptions,
    buffer: Arc<Mutex<VecDeque<Pending>>>,
    wakeup: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    flusher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<F: Forwarder> BufferedPublisher<F> {
    pub fn new(forwarder: F, options: PublisherOptions) -> Self {
        let concurrency = options.concurrency.max(1);
        let (stop_tx, _) = watch::channel(false);
        Self {
            forwarder: Arc::new(forwarder),
            options,
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            wakeup: Arc::new(Notify::new()),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            stop_tx,
            flusher: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the background flusher. A second call while running is a
    /// no-op.
    pub async fn start(&self) {
        let mut guard = self.flusher.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                debug!("publisher flusher already running");
                return;
            }
        }
        self.stop_tx.send_replace(false);
        let worker = Flusher {
            forwarder: self.forwarder.clone(),
            options: self.options.clone(),
            buffer: self.buffer.clone(),
            wakeup: self.wakeup.clone(),
            semaphore: self.semaphore.clone(),
            stop_rx: self.stop_tx.subscribe(),
        };
        *guard = Some(tokio::spawn(worker.run()));
        info!(
            max_batch_size = self.options.max_batch_size,
            flush_interval_ms = self.options.flush_interval.as_millis() as u64,
            concurrency = self.options.concurrency,
            "publisher flusher started"
        );
    }

    /// Stop the flusher after forwarding everything still buffered.
    /// Idempotent.
    pub async fn stop(&self) {
        let handle = { self.flusher.lock().await.take() };
        let Some(handle) = handle else {
            return;
        };
        self.stop_tx.send_replace(true);
        self.wakeup.notify_one();
        if let Err(e) = handle.await {
            error!(error = ?e, "publisher flusher terminated abnormally");
        }
        debug!("publisher flusher stopped");
    }

    /// Hand an event to the publisher and wait until its batch has been
    /// forwarded. Fails fast with [`OutboxError::Backpressure`] when the
    /// buffer is full, and with the forwarding error when the batch
    /// terminally fails. Both reject the bus handler so the outbox
    /// re-queues the event.
    pub async fn deliver(&self, event: Event) -> anyhow::Result<()> {
        let rx = self.enqueue(event).map_err(anyhow::Error::new)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "publisher stopped before the event was forwarded"
            )),
        }
    }

    /// Bus-compatible handler forwarding each dispatched event.
    pub fn handler(self: Arc<Self>) -> EventHandler {
        Arc::new(move |event| {
            let publisher = self.clone();
            Box::pin(async move { publisher.deliver(event).await })
        })
    }

    /// Number of events currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    fn enqueue(&self, event: Event) -> Result<oneshot::Receiver<anyhow::Result<()>>, OutboxError> {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.options.max_buffered {
            return Err(OutboxError::Backpressure);
        }
        let (done, rx) = oneshot::channel();
        buffer.push_back(Pending { event, done });
        let batch_ready = buffer.len() >= self.options.max_batch_size;
        drop(buffer);
        if batch_ready {
            self.wakeup.notify_one();
        }
        Ok(rx)
    }
}

struct Flusher<F: Forwarder> {
    forwarder: Arc<F>,
    options: PublisherOptions,
    buffer: Arc<Mutex<VecDeque<Pending>>>,
    wakeup: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    stop_rx: watch::Receiver<bool>,
}

impl<F: Forwarder> Flusher<F> {
    async fn run(mut self) {
        let mut inflight = JoinSet::new();
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.flush_interval) => {}
                _ = self.wakeup.notified() => {}
                _ = self.stop_rx.changed() => {}
            }
            self.dispatch_ready(&mut inflight);
            // Reap finished forwards without blocking the next tick.
            while inflight.try_join_next().is_some() {}
        }
        // Final drain: forward everything still buffered, then await all
        // in-flight batches.
        self.dispatch_ready(&mut inflight);
        while inflight.join_next().await.is_some() {}
        debug!("publisher flusher exited");
    }

    fn dispatch_ready(&self, inflight: &mut JoinSet<()>) {
        while let Some(batch) = self.next_batch() {
            let forwarder = self.forwarder.clone();
            let retry = self.options.retry.clone();
            let semaphore = self.semaphore.clone();
            inflight.spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                forward_batch(forwarder.as_ref(), &retry, batch).await;
                drop(permit);
            });
        }
    }

    fn next_batch(&self) -> Option<Vec<Pending>> {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return None;
        }
        let take = buffer.len().min(self.options.max_batch_size);
        Some(buffer.drain(..take).collect())
    }
}

/// Forward one batch with retries, then settle every event's outcome.
async fn forward_batch<F: Forwarder>(forwarder: &F, retry: &RetryPolicy, batch: Vec<Pending>) {
    let events: Vec<Event> = batch.iter().map(|pending| pending.event.clone()).collect();

    let mut failures = 0u32;
    let outcome = loop {
        match forwarder.forward(&events).await {
            Ok(()) => break Ok(()),
            Err(err) => {
                failures += 1;
                if failures > retry.max_retries {
                    break Err(err);
                }
                let delay = retry.delay_for(failures);
                warn!(
                    batch_size = events.len(),
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "forward failed, retrying batch"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };

    match outcome {
        Ok(()) => {
            debug!(batch_size = batch.len(), "batch forwarded");
            for pending in batch {
                let _ = pending.done.send(Ok(()));
            }
        }
        Err(err) => {
            let message = format_error_message(&err);
            error!(
                batch_size = batch.len(),
                error = %message,
                "batch terminally failed, rejecting events back to the outbox"
            );
            for pending in batch {
                let _ = pending.done.send(Err(anyhow::anyhow!(message.clone())));
            }
        }
    }
}
