//! End-to-end tests for the bus over the in-memory reference adapter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use outbox_bus::{BusConfig, Middleware, MiddlewareContext, Next, OutboxBus, Phase};
use outbox_core::{
    error_hook, event_handler, with_collector, BatchCollector, Event, EventStatus, EventStore,
    InMemoryStore, OutboxError, OutboxOptions, OutboxResult, SharedCollector, StoredEvent,
};
use uuid::Uuid;

fn fast_options() -> OutboxOptions {
    OutboxOptions {
        poll_interval: Duration::from_millis(25),
        base_backoff: Duration::from_millis(50),
        ..OutboxOptions::default()
    }
}

fn new_bus() -> (Arc<InMemoryStore>, OutboxBus<InMemoryStore>) {
    let options = fast_options();
    let store = Arc::new(InMemoryStore::with_options(options.clone()));
    let bus = OutboxBus::new(
        store.clone(),
        BusConfig::new(error_hook(|_| {})).with_options(options),
    );
    (store, bus)
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn counting_handler() -> (outbox_core::EventHandler, Arc<AtomicU32>) {
    let count = Arc::new(AtomicU32::new(0));
    let counter = count.clone();
    let handler = event_handler(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (handler, count)
}

#[tokio::test]
async fn emit_delivers_to_the_registered_listener() {
    let (store, bus) = new_bus();

    let received: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.on(
        "greeting.sent",
        event_handler(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        }),
    )
    .unwrap();

    bus.start().await;
    let event = Event::new("greeting.sent", serde_json::json!({ "msg": "hello" }));
    let id = event.id;
    assert!(bus.emit(event, None).await.unwrap());

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.status_of(id) == Some(EventStatus::Completed)
        })
        .await
    );
    bus.stop().await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, serde_json::json!({ "msg": "hello" }));
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let (_store, bus) = new_bus();
    let (handler, _) = counting_handler();

    bus.on("test.dup", handler.clone()).unwrap();
    let err = bus.on("test.dup", handler).expect_err("second on must fail");
    assert!(matches!(err, OutboxError::DuplicateListener { .. }));
}

#[tokio::test]
async fn subscribe_is_atomic_across_types() {
    let (_store, bus) = new_bus();
    let (handler, _) = counting_handler();

    bus.on("test.b", handler.clone()).unwrap();

    let err = bus
        .subscribe(&["test.a", "test.b", "test.c"], handler.clone())
        .expect_err("conflict on test.b");
    assert!(matches!(err, OutboxError::DuplicateListener { .. }));

    // No partial registration.
    assert_eq!(bus.listener_count("test.a"), 0);
    assert_eq!(bus.listener_count("test.c"), 0);
    assert_eq!(bus.subscription_count(), 1);

    bus.subscribe(&["test.a", "test.c"], handler).unwrap();
    assert_eq!(bus.subscription_count(), 3);
    let mut names = bus.event_names();
    names.sort();
    assert_eq!(names, vec!["test.a", "test.b", "test.c"]);
}

#[tokio::test]
async fn off_before_emit_means_zero_invocations() {
    let (store, bus) = new_bus();
    let (handler, count) = counting_handler();

    bus.on("test.removed", handler.clone()).unwrap();
    assert!(bus.off("test.removed", &handler));
    assert_eq!(bus.subscription_count(), 0);

    bus.start().await;
    let event = Event::new("test.removed", serde_json::json!({}));
    let id = event.id;
    bus.emit(event, None).await.unwrap();

    // Unhandled types are acknowledged as a silent success.
    assert!(
        wait_until(Duration::from_secs(2), || {
            store.status_of(id) == Some(EventStatus::Completed)
        })
        .await
    );
    bus.stop().await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn once_fires_exactly_once_and_unregisters() {
    let (store, bus) = new_bus();
    let (handler, count) = counting_handler();

    bus.once("test.once", handler).unwrap();
    bus.start().await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let event = Event::new("test.once", serde_json::json!({}));
        ids.push(event.id);
        bus.emit(event, None).await.unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(2), || {
            ids.iter()
                .all(|id| store.status_of(*id) == Some(EventStatus::Completed))
        })
        .await
    );
    bus.stop().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn off_with_the_original_reference_removes_a_once_listener() {
    let (_store, bus) = new_bus();
    let (handler, _) = counting_handler();

    bus.once("test.once-off", handler.clone()).unwrap();
    assert_eq!(bus.listener_count("test.once-off"), 1);
    assert!(bus.off("test.once-off", &handler));
    assert_eq!(bus.listener_count("test.once-off"), 0);
}

#[tokio::test]
async fn wait_for_resolves_with_the_next_event() {
    let (_store, bus) = new_bus();
    let bus = Arc::new(bus);
    bus.start().await;

    let waiter = {
        let bus = bus.clone();
        tokio::spawn(async move { bus.wait_for("test.waited", Duration::from_secs(5)).await })
    };

    // Give the waiter time to register its one-shot handler.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let event = Event::new("test.waited", serde_json::json!({ "n": 9 }));
    let id = event.id;
    bus.emit(event, None).await.unwrap();

    let received = waiter.await.unwrap().unwrap();
    assert_eq!(received.id, id);
    assert_eq!(received.payload, serde_json::json!({ "n": 9 }));
    bus.stop().await;

    // The one-shot handler cleaned itself up.
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn wait_for_times_out_and_cleans_up() {
    let (_store, bus) = new_bus();

    let err = bus
        .wait_for("test.never", Duration::from_millis(50))
        .await
        .expect_err("nothing is emitted");
    match err {
        OutboxError::Timeout { event_type, waited } => {
            assert_eq!(event_type, "test.never");
            assert_eq!(waited, Duration::from_millis(50));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn emit_many_empty_never_reaches_the_adapter() {
    struct CountingStore {
        inner: InMemoryStore,
        publishes: AtomicU32,
    }

    #[async_trait]
    impl EventStore for CountingStore {
        type Tx = BatchCollector;

        async fn publish(
            &self,
            events: Vec<Event>,
            tx: Option<&mut BatchCollector>,
        ) -> OutboxResult<()> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            self.inner.publish(events, tx).await
        }

        async fn claim_next_batch(&self) -> OutboxResult<Vec<StoredEvent>> {
            self.inner.claim_next_batch().await
        }

        async fn mark_complete(&self, id: Uuid) -> OutboxResult<()> {
            self.inner.mark_complete(id).await
        }

        async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()> {
            self.inner.mark_failed(id, error).await
        }
    }

    let store = Arc::new(CountingStore {
        inner: InMemoryStore::new(),
        publishes: AtomicU32::new(0),
    });
    let bus = OutboxBus::new(store.clone(), BusConfig::new(error_hook(|_| {})));

    assert_eq!(bus.emit_many(Vec::new(), None).await.unwrap(), 0);
    assert_eq!(store.publishes.load(Ordering::SeqCst), 0);

    bus.emit_many(vec![Event::new("test.one", serde_json::json!({}))], None)
        .await
        .unwrap();
    assert_eq!(store.publishes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn emit_middleware_can_drop_events_before_publish() {
    struct DropInternal;

    #[async_trait]
    impl Middleware for DropInternal {
        async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> anyhow::Result<()> {
            if ctx.phase == Phase::Emit && ctx.event.event_type.starts_with("internal.") {
                next.drop_event();
                return Ok(());
            }
            next.run(ctx).await
        }
    }

    let (store, bus) = new_bus();
    bus.add_middleware(Arc::new(DropInternal));

    let dropped = Event::new("internal.heartbeat", serde_json::json!({}));
    let dropped_id = dropped.id;
    assert!(!bus.emit(dropped, None).await.unwrap());
    assert!(store.get(dropped_id).is_none());

    let kept = Event::new("order.placed", serde_json::json!({}));
    let kept_id = kept.id;
    assert!(bus.emit(kept, None).await.unwrap());
    assert_eq!(store.status_of(kept_id), Some(EventStatus::Created));
}

#[tokio::test]
async fn handler_middleware_wraps_dispatch() {
    struct Tracer {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tracer {
        async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> anyhow::Result<()> {
            let phase = match ctx.phase {
                Phase::Emit => "emit",
                Phase::Handler => "handler",
            };
            self.log.lock().unwrap().push(format!("{phase}:before"));
            next.run(ctx).await?;
            self.log.lock().unwrap().push(format!("{phase}:after"));
            Ok(())
        }
    }

    let (store, bus) = new_bus();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    bus.add_middleware(Arc::new(Tracer { log: log.clone() }));

    let dispatch_log = log.clone();
    bus.on(
        "test.traced",
        event_handler(move |_| {
            let log = dispatch_log.clone();
            async move {
                log.lock().unwrap().push("listener".to_string());
                Ok(())
            }
        }),
    )
    .unwrap();

    bus.start().await;
    let event = Event::new("test.traced", serde_json::json!({}));
    let id = event.id;
    bus.emit(event, None).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || {
            store.status_of(id) == Some(EventStatus::Completed)
        })
        .await
    );
    bus.stop().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "emit:before",
            "emit:after",
            "handler:before",
            "listener",
            "handler:after"
        ]
    );
}

#[tokio::test]
async fn transactional_emit_is_not_durable_until_commit() {
    let (store, bus) = new_bus();
    let (handler, count) = counting_handler();
    bus.on("billing.invoiced", handler).unwrap();
    bus.start().await;

    let collector: SharedCollector =
        Arc::new(parking_lot::Mutex::new(BatchCollector::new()));
    let event = Event::new("billing.invoiced", serde_json::json!({ "amount": 12 }));
    let id = event.id;

    with_collector(collector.clone(), async {
        bus.emit(event, None).await.unwrap();
    })
    .await;

    // Rolled back: nothing durable, nothing delivered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get(id).is_none());
    assert_eq!(count.load(Ordering::SeqCst), 0);

    // Committed: delivered.
    store.commit_collector(&mut collector.lock()).unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            store.status_of(id) == Some(EventStatus::Completed)
        })
        .await
    );
    bus.stop().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_event_management_delegates_to_the_adapter() {
    let (store, bus) = new_bus();

    let event = Event::new("test.dead", serde_json::json!({}));
    let id = event.id;
    let mut row = StoredEvent::created(event);
    row.status = EventStatus::Failed;
    row.retry_count = 6;
    row.last_error = Some("boom".to_string());
    store.insert_raw(row);

    let failed = bus.failed_events().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].event.id, id);

    bus.retry_events(&[id]).await.unwrap();
    assert_eq!(store.status_of(id), Some(EventStatus::Created));
}

#[tokio::test]
async fn capability_gaps_surface_as_unsupported() {
    struct MinimalStore;

    #[async_trait]
    impl EventStore for MinimalStore {
        type Tx = BatchCollector;

        async fn publish(
            &self,
            _events: Vec<Event>,
            _tx: Option<&mut BatchCollector>,
        ) -> OutboxResult<()> {
            Ok(())
        }

        async fn claim_next_batch(&self) -> OutboxResult<Vec<StoredEvent>> {
            Ok(Vec::new())
        }

        async fn mark_complete(&self, _id: Uuid) -> OutboxResult<()> {
            Ok(())
        }

        async fn mark_failed(&self, _id: Uuid, _error: &str) -> OutboxResult<()> {
            Ok(())
        }
    }

    let bus = OutboxBus::new(Arc::new(MinimalStore), BusConfig::new(error_hook(|_| {})));

    let err = bus.failed_events().await.expect_err("no capability");
    assert!(matches!(
        err,
        OutboxError::Unsupported {
            operation: "list_failed"
        }
    ));
    let err = bus
        .retry_events(&[Uuid::new_v4()])
        .await
        .expect_err("no capability");
    assert!(matches!(
        err,
        OutboxError::Unsupported {
            operation: "retry_events"
        }
    ));
}

#[tokio::test]
async fn handler_rejections_feed_the_retry_schedule() {
    let (store, bus) = new_bus();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    bus.on(
        "test.flaky",
        event_handler(move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("first attempt fails"))
                } else {
                    Ok(())
                }
            }
        }),
    )
    .unwrap();

    bus.start().await;
    let event = Event::new("test.flaky", serde_json::json!({}));
    let id = event.id;
    bus.emit(event, None).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            store.status_of(id) == Some(EventStatus::Completed)
        })
        .await
    );
    bus.stop().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(store.get(id).unwrap().retry_count, 1);
}
