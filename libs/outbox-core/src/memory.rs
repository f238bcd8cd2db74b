//! In-memory storage adapter.
//!
//! Canonical semantics reference for the storage contract, used by the
//! conformance suite and suitable for unit tests and local development.
//! All state lives behind a single mutex, which makes every claim
//! transition atomic and gives concurrent workers the same single-claimant
//! guarantee a production backend provides with locks or conditional
//! writes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collector::{current_collector, BatchCollector};
use crate::config::OutboxOptions;
use crate::error::{OutboxError, OutboxResult};
use crate::event::{Event, EventStatus, FailedEvent, StoredEvent};
use crate::retry::RetryPolicy;
use crate::store::EventStore;

struct MemoryState {
    /// Live table, keyed by event id.
    events: HashMap<Uuid, StoredEvent>,
    /// Claim order: ids in insertion order.
    order: Vec<Uuid>,
}

/// In-memory [`EventStore`] with full lifecycle semantics.
///
/// Transaction tokens are [`BatchCollector`]s: a publish under a token
/// buffers the writes, and nothing is durable until the caller commits the
/// collector via [`InMemoryStore::commit_collector`]. Dropping the
/// collector without committing rolls the writes back.
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    options: OutboxOptions,
    policy: RetryPolicy,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_options(OutboxOptions::default())
    }

    pub fn with_options(options: OutboxOptions) -> Self {
        let policy = options.retry_policy();
        Self {
            state: Mutex::new(MemoryState {
                events: HashMap::new(),
                order: Vec::new(),
            }),
            options,
            policy,
        }
    }

    /// Insert a raw stored-event row, bypassing `publish`. For tests and
    /// operational backfills.
    pub fn insert_raw(&self, stored: StoredEvent) {
        let mut state = self.state.lock();
        let id = stored.event.id;
        if state.events.insert(id, stored).is_none() {
            state.order.push(id);
        }
    }

    /// Snapshot of a stored event, if it exists in the live table.
    pub fn get(&self, id: Uuid) -> Option<StoredEvent> {
        self.state.lock().events.get(&id).cloned()
    }

    /// Current status of an event.
    pub fn status_of(&self, id: Uuid) -> Option<EventStatus> {
        self.state.lock().events.get(&id).map(|stored| stored.status)
    }

    /// Completed events, retained in place as the archive view.
    pub fn completed(&self) -> Vec<StoredEvent> {
        self.state
            .lock()
            .events
            .values()
            .filter(|stored| stored.status == EventStatus::Completed)
            .cloned()
            .collect()
    }

    /// Apply a collector's buffered writes durably: the caller-side commit
    /// for collector transactions.
    pub fn commit_collector(&self, collector: &mut BatchCollector) -> OutboxResult<()> {
        let events = collector.take_items();
        if events.is_empty() {
            return Ok(());
        }
        debug!(count = events.len(), "committing collected event writes");
        self.insert_created(events);
        Ok(())
    }

    fn insert_created(&self, events: Vec<Event>) {
        let mut state = self.state.lock();
        for event in events {
            let id = event.id;
            if state.events.insert(id, StoredEvent::created(event)).is_none() {
                state.order.push(id);
            }
        }
    }

    fn interval(duration: Duration) -> chrono::Duration {
        chrono::Duration::milliseconds(duration.as_millis() as i64)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    type Tx = BatchCollector;

    async fn publish(
        &self,
        events: Vec<Event>,
        tx: Option<&mut BatchCollector>,
    ) -> OutboxResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        // Token resolution: explicit, then ambient, then standalone commit.
        if let Some(collector) = tx {
            collector.push_all(events)?;
            return Ok(());
        }
        if let Some(ambient) = current_collector() {
            ambient.lock().push_all(events)?;
            return Ok(());
        }
        debug!(count = events.len(), "events inserted into outbox");
        self.insert_created(events);
        Ok(())
    }

    async fn claim_next_batch(&self) -> OutboxResult<Vec<StoredEvent>> {
        let now = Utc::now();
        let deadline = now + Self::interval(self.options.processing_timeout);
        let mut state = self.state.lock();
        let mut claimed = Vec::new();
        let order = state.order.clone();

        for id in order {
            if claimed.len() >= self.options.batch_size {
                break;
            }
            let Some(stored) = state.events.get_mut(&id) else {
                continue;
            };
            let due = match stored.status {
                EventStatus::Created => stored.next_attempt_at <= now,
                EventStatus::Active => stored
                    .visibility_deadline
                    .map(|expiry| expiry <= now)
                    .unwrap_or(false),
                EventStatus::Completed | EventStatus::Failed => false,
            };
            if !due {
                continue;
            }
            if self.options.max_retries == 0 {
                // Zero retry budget: dead-letter without dispatch.
                stored.status = EventStatus::Failed;
                stored.last_error = Some("retry budget is zero".to_string());
                stored.visibility_deadline = None;
                warn!(event_id = %id, "event dead-lettered: retry budget is zero");
                continue;
            }
            stored.status = EventStatus::Active;
            stored.started_on = Some(now);
            stored.visibility_deadline = Some(deadline);
            claimed.push(stored.clone());
        }

        Ok(claimed)
    }

    async fn mark_complete(&self, id: Uuid) -> OutboxResult<()> {
        let mut state = self.state.lock();
        let stored = state
            .events
            .get_mut(&id)
            .ok_or(OutboxError::EventNotFound(id))?;
        stored.status = EventStatus::Completed;
        stored.completed_on = Some(Utc::now());
        stored.visibility_deadline = None;
        debug!(event_id = %id, "event completed");
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let stored = state
            .events
            .get_mut(&id)
            .ok_or(OutboxError::EventNotFound(id))?;

        let exhausted = self.policy.exhausted(stored.retry_count);
        stored.retry_count += 1;
        stored.last_error = Some(error.to_string());
        stored.visibility_deadline = None;

        if exhausted {
            stored.status = EventStatus::Failed;
            warn!(
                event_id = %id,
                retry_count = stored.retry_count,
                error = %error,
                "event dead-lettered"
            );
        } else {
            stored.status = EventStatus::Created;
            stored.next_attempt_at =
                now + Self::interval(self.policy.delay_for(stored.retry_count));
            debug!(
                event_id = %id,
                retry_count = stored.retry_count,
                next_attempt_at = %stored.next_attempt_at,
                "event scheduled for retry"
            );
        }
        Ok(())
    }

    async fn recover_stuck(&self) -> OutboxResult<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut recovered = 0u64;
        for stored in state.events.values_mut() {
            if stored.status != EventStatus::Active {
                continue;
            }
            let expired = stored
                .visibility_deadline
                .map(|expiry| expiry <= now)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            // A slow handler is not a failed handler: re-queue without
            // touching the retry budget.
            stored.status = EventStatus::Created;
            stored.visibility_deadline = None;
            recovered += 1;
        }
        if recovered > 0 {
            debug!(recovered, "returned stuck events to the claimable set");
        }
        Ok(recovered)
    }

    async fn list_failed(&self, limit: usize) -> OutboxResult<Vec<FailedEvent>> {
        let state = self.state.lock();
        let mut failed: Vec<&StoredEvent> = state
            .events
            .values()
            .filter(|stored| stored.status == EventStatus::Failed)
            .collect();
        failed.sort_by(|a, b| b.event.occurred_at.cmp(&a.event.occurred_at));
        Ok(failed
            .into_iter()
            .take(limit)
            .map(|stored| FailedEvent {
                event: stored.event.clone(),
                retry_count: stored.retry_count,
                error: stored.last_error.clone(),
                last_attempt_at: stored.started_on,
            })
            .collect())
    }

    async fn retry_events(&self, ids: &[Uuid]) -> OutboxResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        for id in ids {
            let Some(stored) = state.events.get_mut(id) else {
                continue;
            };
            if stored.status != EventStatus::Failed {
                continue;
            }
            stored.status = EventStatus::Created;
            stored.retry_count = 0;
            stored.last_error = None;
            stored.next_attempt_at = now;
            stored.visibility_deadline = None;
            debug!(event_id = %id, "dead-lettered event re-queued");
        }
        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(usize, Duration)> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut pending = 0usize;
        let mut oldest: Option<DateTime<Utc>> = None;
        for stored in state.events.values() {
            if !matches!(stored.status, EventStatus::Created | EventStatus::Active) {
                continue;
            }
            pending += 1;
            if oldest.map(|seen| stored.event.occurred_at < seen).unwrap_or(true) {
                oldest = Some(stored.event.occurred_at);
            }
        }
        let age = oldest
            .and_then(|occurred_at| (now - occurred_at).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Ok((pending, age))
    }
}
