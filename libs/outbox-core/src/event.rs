//! Event model: what callers emit and what adapters persist.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable domain event produced by a caller and persisted by a storage
/// adapter.
///
/// Events are written to the outbox within the caller's storage transaction
/// alongside business writes, then handed to registered handlers by the
/// background processor. Deduplication is by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: Uuid,

    /// Fully qualified event type (e.g., "user.created"). Non-empty.
    pub event_type: String,

    /// Event payload as JSON.
    pub payload: serde_json::Value,

    /// Timestamp when the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Optional string-keyed metadata (correlation_id, trace_id, etc.)
    pub metadata: Option<HashMap<String, String>>,
}

impl Event {
    /// Create a new event with a fresh UUID and `occurred_at` set to now.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
            metadata: None,
        }
    }

    /// Replace the generated id with a caller-supplied identity.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Replace the occurred-at instant.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Status of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    /// Ready to claim.
    Created,
    /// Claimed by a worker, with a visibility deadline.
    Active,
    /// Handler returned success. Terminal for the live table.
    Completed,
    /// Terminally rejected: retries exhausted or manually failed. Quiescent
    /// until an operator re-queues it.
    Failed,
}

/// What an adapter persists: the event plus processing bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,

    pub status: EventStatus,

    /// Number of failed handler attempts so far. Monotone non-decreasing;
    /// reset to 0 only by an operator retry.
    pub retry_count: u32,

    /// Instant at which this event becomes eligible to claim. Never before
    /// `occurred_at`.
    pub next_attempt_at: DateTime<Utc>,

    /// Set while `Active`; past this instant the event counts as stuck and
    /// becomes claimable again.
    pub visibility_deadline: Option<DateTime<Utc>>,

    /// Timestamp of the most recent claim.
    pub started_on: Option<DateTime<Utc>>,

    /// Timestamp of completion.
    pub completed_on: Option<DateTime<Utc>>,

    /// Most recent handler error message.
    pub last_error: Option<String>,
}

impl StoredEvent {
    /// Stored form of a freshly published event: `Created`, zero retries,
    /// due as soon as it occurred.
    pub fn created(event: Event) -> Self {
        let next_attempt_at = event.occurred_at;
        Self {
            event,
            status: EventStatus::Created,
            retry_count: 0,
            next_attempt_at,
            visibility_deadline: None,
            started_on: None,
            completed_on: None,
            last_error: None,
        }
    }
}

/// A dead-lettered event as returned by [`EventStore::list_failed`].
///
/// [`EventStore::list_failed`]: crate::store::EventStore::list_failed
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event: Event,
    pub retry_count: u32,
    /// Most recent handler error message, if any was recorded.
    pub error: Option<String>,
    /// When the last processing attempt was claimed.
    pub last_attempt_at: Option<DateTime<Utc>>,
}
