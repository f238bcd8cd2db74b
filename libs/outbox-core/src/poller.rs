//! Polling service driving claim/process/settle cycles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OutboxOptions;
use crate::error::{format_error_message, report_event_error, OutboxResult};
use crate::handler::{ErrorHook, EventHandler};
use crate::metrics::OutboxMetrics;
use crate::store::EventStore;

/// Background loop that drives one storage adapter instance on a cadence.
///
/// Each tick runs stuck-recovery maintenance, claims a batch, dispatches
/// every claimed event to the handler, and settles the outcome. Handler
/// rejections feed the per-event retry schedule; adapter-level errors back
/// the loop itself off exponentially, capped at `max_error_backoff`. The
/// loop never dies on an error.
pub struct PollingService<S: EventStore> {
    store: Arc<S>,
    options: OutboxOptions,
    metrics: Option<OutboxMetrics>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: EventStore> PollingService<S> {
    pub fn new(store: Arc<S>, options: OutboxOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            options,
            metrics: None,
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Also refresh Prometheus gauges each polling cycle.
    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Begin the polling loop. A second call while the loop is running is a
    /// no-op.
    pub async fn start(&self, handler: EventHandler, on_error: ErrorHook) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                debug!("polling service already running");
                return;
            }
        }
        self.stop_tx.send_replace(false);
        let worker = Worker {
            store: self.store.clone(),
            options: self.options.clone(),
            metrics: self.metrics.clone(),
            handler,
            on_error,
            stop_rx: self.stop_tx.subscribe(),
        };
        *guard = Some(tokio::spawn(worker.run()));
        info!(
            batch_size = self.options.batch_size,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            max_retries = self.options.max_retries,
            "outbox polling service started"
        );
    }

    /// Stop the loop: cancel the pending tick and await the in-flight
    /// batch. Handlers are never interrupted; events not yet claimed stay
    /// `Created`. Idempotent, and never fails for in-flight handler
    /// errors.
    pub async fn stop(&self) {
        let handle = { self.handle.lock().await.take() };
        let Some(handle) = handle else {
            return;
        };
        self.stop_tx.send_replace(true);
        if let Err(e) = handle.await {
            // Only teardown failures (a panicked worker task) surface here.
            error!(error = ?e, "polling task terminated abnormally");
        }
        debug!("outbox polling service stopped");
    }

    /// Whether the loop is currently running.
    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

struct Worker<S: EventStore> {
    store: Arc<S>,
    options: OutboxOptions,
    metrics: Option<OutboxMetrics>,
    handler: EventHandler,
    on_error: ErrorHook,
    stop_rx: watch::Receiver<bool>,
}

impl<S: EventStore> Worker<S> {
    async fn run(mut self) {
        let mut error_count: u32 = 0;
        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            match self.tick().await {
                Ok(processed) => {
                    error_count = 0;
                    if processed > 0 {
                        debug!(processed, "processed outbox batch");
                    }
                }
                Err(e) => {
                    error_count = error_count.saturating_add(1);
                    warn!(error = %e, error_count, "outbox poll tick failed");
                    (self.on_error)(e);
                }
            }
            self.refresh_metrics().await;

            let delay = self.next_delay(error_count);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("outbox polling loop exited");
    }

    /// One maintenance + claim/process/settle cycle. Handler rejections are
    /// settled inside; only adapter-level failures bubble up.
    async fn tick(&self) -> OutboxResult<usize> {
        self.store.recover_stuck().await?;

        let batch = self.store.claim_next_batch().await?;
        let mut processed = 0usize;
        for stored in batch {
            let event = stored.event.clone();
            match (self.handler)(event.clone()).await {
                Ok(()) => {
                    self.store.mark_complete(event.id).await?;
                    if let Some(metrics) = &self.metrics {
                        metrics.completed.inc();
                    }
                    processed += 1;
                }
                Err(cause) => {
                    let message = format_error_message(&cause);
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        retry_count = stored.retry_count,
                        error = %message,
                        "handler rejected event"
                    );
                    self.store.mark_failed(event.id, &message).await?;
                    if let Some(metrics) = &self.metrics {
                        if stored.retry_count >= self.options.max_retries {
                            metrics.dead_lettered.inc();
                        } else {
                            metrics.failed_attempts.inc();
                        }
                    }
                    report_event_error(
                        |err| (self.on_error)(err),
                        cause,
                        &event,
                        stored.retry_count,
                        self.options.max_retries,
                    );
                }
            }
        }
        Ok(processed)
    }

    async fn refresh_metrics(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        if let Ok((pending, age)) = self.store.pending_stats().await {
            metrics.pending.set(pending as i64);
            metrics.oldest_pending_age_seconds.set(age.as_secs() as i64);
        }
    }

    /// Nominal period on success; `min(poll_interval * 2^error_count,
    /// max_error_backoff)` while the adapter is degraded.
    fn next_delay(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return self.options.poll_interval;
        }
        let factor = 1u64 << error_count.min(20);
        let backed_ms = (self.options.poll_interval.as_millis() as u64)
            .saturating_mul(factor)
            .min(self.options.max_error_backoff.as_millis() as u64);
        Duration::from_millis(backed_ms)
    }
}
