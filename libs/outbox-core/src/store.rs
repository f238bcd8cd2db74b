//! Storage adapter contract.
//!
//! Backends implement [`EventStore`] to plug into the processing engine.
//! The claim step is where backends differ most: relational stores use
//! `SELECT ... FOR UPDATE SKIP LOCKED`, document stores a per-event
//! find-and-update re-asserting the candidate predicate, key-value stores
//! an atomic move between sorted sets, wide-column stores a conditional
//! update per id. Whatever the mechanism, single-claimant semantics are
//! mandatory and a lost race is a silent skip, never an error.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{OutboxError, OutboxResult};
use crate::event::{Event, FailedEvent, StoredEvent};

/// Backend-specific storage for outbox events.
///
/// Capability methods (`list_failed`, `retry_events`, `pending_stats`)
/// have default bodies that report [`OutboxError::Unsupported`]; adapters
/// override the ones they can honor.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Backend-specific transaction token. Work done under a token is
    /// enlisted in the caller's atomic unit instead of committing
    /// standalone; completing the transaction is the caller's job.
    type Tx: Send;

    /// Persist `events` with status `Created`, zero retries, and
    /// `next_attempt_at = occurred_at`.
    ///
    /// A single call is atomic: either all events are durable or none are.
    /// With a token (explicit here, or ambient for adapters that consult a
    /// task-local context) the writes MUST ride that transaction and not
    /// flush independently. Empty input is a success no-op.
    async fn publish(&self, events: Vec<Event>, tx: Option<&mut Self::Tx>) -> OutboxResult<()>;

    /// Claim up to the configured batch size of due events for this worker.
    ///
    /// Candidates are `Created` events whose `next_attempt_at` has passed
    /// and `Active` events whose visibility deadline has expired (stuck).
    /// Each claimed event is atomically transitioned to `Active` with
    /// `started_on = now` and a fresh visibility deadline. At most one
    /// worker may win each event; a lost race is silently skipped.
    async fn claim_next_batch(&self) -> OutboxResult<Vec<StoredEvent>>;

    /// Record handler success: `Completed`, `completed_on = now`, removed
    /// from the due index. Adapters that archive completed events write the
    /// archive row in the same transaction as the removal.
    async fn mark_complete(&self, id: Uuid) -> OutboxResult<()>;

    /// Record a handler failure: bump `retry_count`, then either schedule
    /// the next attempt (`Created` with a backoff delay and `last_error`
    /// set) or dead-letter the event (`Failed`) when the budget is spent.
    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Return expired-visibility `Active` events to the claimable set.
    ///
    /// The default is a no-op for adapters whose claim predicate already
    /// covers expired claims; adapters that prefer an explicit sweep
    /// override it and return the number of recovered events.
    async fn recover_stuck(&self) -> OutboxResult<u64> {
        Ok(0)
    }

    /// Up to the most recent `limit` dead-lettered events, newest
    /// `occurred_at` first.
    async fn list_failed(&self, limit: usize) -> OutboxResult<Vec<FailedEvent>> {
        let _ = limit;
        Err(OutboxError::Unsupported {
            operation: "list_failed",
        })
    }

    /// Re-queue dead-lettered events: `Created`, `retry_count = 0`,
    /// cleared `last_error`, `next_attempt_at = now`. Ids that are missing
    /// or not dead-lettered are silently ignored.
    async fn retry_events(&self, ids: &[Uuid]) -> OutboxResult<()> {
        let _ = ids;
        Err(OutboxError::Unsupported {
            operation: "retry_events",
        })
    }

    /// Pending count and oldest pending age, for metrics.
    async fn pending_stats(&self) -> OutboxResult<(usize, Duration)> {
        Err(OutboxError::Unsupported {
            operation: "pending_stats",
        })
    }
}
