//! Transaction tokens for buffered backends, and the ambient task-local
//! transaction scope.
//!
//! Some backends have no interactive transaction: their "transaction" is a
//! batch of pending write items the caller assembles and submits in one
//! shot. For those, the token is a [`BatchCollector`] the adapter appends
//! its event writes to; the caller submits (commits) the collected batch.
//! The batch cap applies to the collector's total size, not just one
//! publish call.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{OutboxError, OutboxResult};
use crate::event::Event;

/// Hard cap on items enlisted in a single transaction, matching managed
/// stores with bounded transactional batches.
pub const DEFAULT_COLLECTOR_CAPACITY: usize = 100;

/// A buffer of pending event writes acting as a transaction token.
#[derive(Debug)]
pub struct BatchCollector {
    items: Vec<Event>,
    capacity: usize,
}

impl BatchCollector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_COLLECTOR_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity,
        }
    }

    /// Number of items currently enlisted.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items enlisted so far.
    pub fn items(&self) -> &[Event] {
        &self.items
    }

    /// Enlist a single event write.
    pub fn push(&mut self, event: Event) -> OutboxResult<()> {
        self.push_all(vec![event])
    }

    /// Enlist a batch of event writes, all or none.
    ///
    /// Fails with [`OutboxError::BatchSizeLimit`] when the combined size
    /// would exceed the cap, leaving the collector untouched.
    pub fn push_all(&mut self, events: Vec<Event>) -> OutboxResult<()> {
        let attempted = self.items.len() + events.len();
        if attempted > self.capacity {
            return Err(OutboxError::BatchSizeLimit {
                limit: self.capacity,
                attempted,
            });
        }
        self.items.extend(events);
        Ok(())
    }

    /// Drain the enlisted items for submission.
    pub fn take_items(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.items)
    }
}

impl Default for BatchCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a collector, as installed in the ambient scope.
pub type SharedCollector = Arc<Mutex<BatchCollector>>;

tokio::task_local! {
    static AMBIENT_COLLECTOR: SharedCollector;
}

/// Run `fut` with `collector` installed as the ambient transaction token
/// for the current task.
///
/// Every `publish` without an explicit token inside the scope enlists into
/// this collector instead of committing standalone. The scope is released
/// on all exit paths, including panics and cancellation.
pub async fn with_collector<F>(collector: SharedCollector, fut: F) -> F::Output
where
    F: Future,
{
    AMBIENT_COLLECTOR.scope(collector, fut).await
}

/// The ambient transaction token, if the current task is inside a
/// [`with_collector`] scope.
pub fn current_collector() -> Option<SharedCollector> {
    AMBIENT_COLLECTOR.try_with(|collector| collector.clone()).ok()
}
