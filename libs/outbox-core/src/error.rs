//! Error types for the outbox event bus.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::event::Event;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// A handler is already registered for this event type
    #[error("a listener is already registered for event type '{event_type}'")]
    DuplicateListener { event_type: String },

    /// A `wait_for` deadline expired before the event arrived
    #[error("timed out after {waited:?} waiting for event type '{event_type}'")]
    Timeout { event_type: String, waited: Duration },

    /// The storage adapter does not implement the requested capability
    #[error("storage adapter does not support '{operation}'")]
    Unsupported { operation: &'static str },

    /// Single-transaction batch cap exceeded
    #[error("batch size limit exceeded: attempted {attempted} items, limit is {limit}")]
    BatchSizeLimit { limit: usize, attempted: usize },

    /// Retry budget exhausted for an event. Raised exactly once per event,
    /// with the final cause attached.
    #[error("retry budget exhausted after {retries} attempts for event {}", .event.id)]
    MaxRetriesExceeded {
        event: Box<Event>,
        retries: u32,
        #[source]
        source: anyhow::Error,
    },

    /// A forwarder reported it can accept no more events
    #[error("publisher buffer is full")]
    Backpressure,

    /// Event not found in the outbox
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Handler rejection while the event still has retry budget
    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A middleware returned without driving its continuation
    #[error("middleware '{name}' returned without calling next")]
    MiddlewareCompletion { name: String },

    /// Generic error with context
    #[error("outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Route a handler failure to the caller's error hook.
///
/// While the event still has retry budget the raw cause is forwarded as
/// [`OutboxError::Handler`]; once `retries_used` reaches `max_retries` the
/// cause is wrapped in [`OutboxError::MaxRetriesExceeded`] instead. The
/// wrapper fires at most once per event because a dead-lettered event is
/// never claimed again.
pub fn report_event_error(
    on_error: impl Fn(OutboxError),
    cause: anyhow::Error,
    event: &Event,
    retries_used: u32,
    max_retries: u32,
) {
    if retries_used >= max_retries {
        on_error(OutboxError::MaxRetriesExceeded {
            event: Box::new(event.clone()),
            retries: retries_used.saturating_add(1),
            source: cause,
        });
    } else {
        on_error(OutboxError::Handler(cause));
    }
}

/// Flatten an error and its source chain into a single string, for
/// persistence in a stored event's `last_error`.
pub fn format_error_message(err: &anyhow::Error) -> String {
    err.chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn batch_size_limit_names_both_sides() {
        let err = OutboxError::BatchSizeLimit {
            limit: 100,
            attempted: 101,
        };
        assert_eq!(
            err.to_string(),
            "batch size limit exceeded: attempted 101 items, limit is 100"
        );
    }

    #[test]
    fn format_error_message_joins_the_source_chain() {
        let err = anyhow::anyhow!("connection reset")
            .context("publish failed")
            .context("tick aborted");
        assert_eq!(
            format_error_message(&err),
            "tick aborted: publish failed: connection reset"
        );
    }

    #[test]
    fn format_error_message_on_a_plain_error() {
        let err = anyhow::anyhow!("Temporary failure");
        assert_eq!(format_error_message(&err), "Temporary failure");
    }

    #[test]
    fn report_forwards_the_raw_cause_while_budget_remains() {
        let seen = Mutex::new(Vec::new());
        let event = Event::new("test.event", serde_json::json!({}));

        report_event_error(
            |e| seen.lock().unwrap().push(e),
            anyhow::anyhow!("boom"),
            &event,
            1,
            5,
        );

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], OutboxError::Handler(_)));
    }

    #[test]
    fn report_wraps_the_terminal_failure() {
        let seen = Mutex::new(Vec::new());
        let event = Event::new("test.event", serde_json::json!({}));

        report_event_error(
            |e| seen.lock().unwrap().push(e),
            anyhow::anyhow!("boom"),
            &event,
            5,
            5,
        );

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            OutboxError::MaxRetriesExceeded { event: failed, retries, .. } => {
                assert_eq!(failed.id, event.id);
                assert_eq!(*retries, 6);
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
    }
}
