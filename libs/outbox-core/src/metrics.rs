use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Prometheus instrumentation for the processing engine.
#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub completed: IntCounter,
    pub failed_attempts: IntCounter,
    pub dead_lettered: IntCounter,
}

impl OutboxMetrics {
    pub fn new(bus: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = IntGauge::with_opts(
            Opts::new(
                "outbox_pending_count",
                "Number of outbox events awaiting delivery",
            )
            .const_label("bus", bus.to_string()),
        )
        .expect("valid metric opts for outbox_pending_count");

        let oldest_pending_age_seconds = IntGauge::with_opts(
            Opts::new(
                "outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest undelivered outbox event",
            )
            .const_label("bus", bus.to_string()),
        )
        .expect("valid metric opts for outbox_oldest_pending_age_seconds");

        let completed = IntCounter::with_opts(
            Opts::new(
                "outbox_completed_total",
                "Total number of outbox events delivered successfully",
            )
            .const_label("bus", bus.to_string()),
        )
        .expect("valid metric opts for outbox_completed_total");

        let failed_attempts = IntCounter::with_opts(
            Opts::new(
                "outbox_failed_attempts_total",
                "Total number of handler attempts that were rejected",
            )
            .const_label("bus", bus.to_string()),
        )
        .expect("valid metric opts for outbox_failed_attempts_total");

        let dead_lettered = IntCounter::with_opts(
            Opts::new(
                "outbox_dead_lettered_total",
                "Total number of outbox events that exhausted their retry budget",
            )
            .const_label("bus", bus.to_string()),
        )
        .expect("valid metric opts for outbox_dead_lettered_total");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(completed.clone()),
            Box::new(failed_attempts.clone()),
            Box::new(dead_lettered.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            completed,
            failed_attempts,
            dead_lettered,
        }
    }
}
