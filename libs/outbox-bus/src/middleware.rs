//! Middleware pipeline shared by the emit and dispatch paths.
//!
//! Middlewares form a classic onion: code before `next` runs in
//! registration order, code after `next` in reverse order. A middleware
//! must drive its [`Next`] continuation exactly once: `next.run(ctx)` to
//! proceed, or `next.drop_event()` to skip the rest of the chain and the
//! terminal action. `Next` is consumed by value, so driving it twice does
//! not compile; returning without driving it is reported as a programming
//! error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use outbox_core::{Event, OutboxError};

/// Pipeline phase a middleware is running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Between `emit` and the adapter's `publish`.
    Emit,
    /// Between a claim and the registered handler.
    Handler,
}

/// Context handed to each middleware. Mutations to the event are visible
/// downstream and to the terminal action.
#[derive(Debug)]
pub struct MiddlewareContext {
    pub phase: Phase,
    pub event: Event,
    /// Whether the emit participates in a caller-supplied transaction.
    pub transactional: bool,
}

/// Terminal action at the end of the chain: enlistment for publication on
/// the emit path, handler invocation on the dispatch path.
pub type Terminal =
    dyn Fn(&MiddlewareContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// An ordered, async pipeline stage.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> anyhow::Result<()>;

    /// Name used in programming-error reports.
    fn name(&self) -> &str {
        "middleware"
    }
}

/// Continuation for the downstream chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
    advanced: &'a AtomicBool,
    dropped: &'a AtomicBool,
}

impl<'a> Next<'a> {
    /// Proceed to the next middleware, or to the terminal action at the end
    /// of the chain.
    pub async fn run(self, ctx: &mut MiddlewareContext) -> anyhow::Result<()> {
        self.advanced.store(true, Ordering::SeqCst);
        run_chain(self.rest, ctx, self.terminal, self.dropped).await
    }

    /// Skip the downstream chain and the terminal action. The pipeline
    /// reports the event as dropped.
    pub fn drop_event(self) {
        self.advanced.store(true, Ordering::SeqCst);
        self.dropped.store(true, Ordering::SeqCst);
    }
}

fn run_chain<'a>(
    chain: &'a [Arc<dyn Middleware>],
    ctx: &'a mut MiddlewareContext,
    terminal: &'a Terminal,
    dropped: &'a AtomicBool,
) -> BoxFuture<'a, anyhow::Result<()>> {
    Box::pin(async move {
        match chain.split_first() {
            None => terminal(ctx).await,
            Some((head, rest)) => {
                let advanced = AtomicBool::new(false);
                let next = Next {
                    rest,
                    terminal,
                    advanced: &advanced,
                    dropped,
                };
                head.handle(ctx, next).await?;
                if !advanced.load(Ordering::SeqCst) {
                    return Err(OutboxError::MiddlewareCompletion {
                        name: head.name().to_string(),
                    }
                    .into());
                }
                Ok(())
            }
        }
    })
}

/// Registered middleware stack.
#[derive(Default, Clone)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run the chain around `terminal`. Returns `true` when the terminal
    /// action ran to completion, `false` when a middleware dropped the
    /// event. Middleware errors abort the chain and propagate.
    pub async fn run(
        &self,
        ctx: &mut MiddlewareContext,
        terminal: &Terminal,
    ) -> anyhow::Result<bool> {
        let dropped = AtomicBool::new(false);
        run_chain(&self.middlewares, ctx, terminal, &dropped).await?;
        Ok(!dropped.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn ctx() -> MiddlewareContext {
        MiddlewareContext {
            phase: Phase::Emit,
            event: Event::new("test.event", serde_json::json!({})),
            transactional: false,
        }
    }

    /// Records a label before and after driving `next`.
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:before", self.label));
            next.run(ctx).await?;
            self.log.lock().push(format!("{}:after", self.label));
            Ok(())
        }
    }

    struct Dropper;

    #[async_trait]
    impl Middleware for Dropper {
        async fn handle(&self, _ctx: &mut MiddlewareContext, next: Next<'_>) -> anyhow::Result<()> {
            next.drop_event();
            Ok(())
        }
    }

    struct Stubborn;

    #[async_trait]
    impl Middleware for Stubborn {
        async fn handle(&self, _ctx: &mut MiddlewareContext, _next: Next<'_>) -> anyhow::Result<()> {
            // Deliberately never drives next.
            Ok(())
        }

        fn name(&self) -> &str {
            "stubborn"
        }
    }

    fn recording_terminal(log: Arc<Mutex<Vec<String>>>) -> Box<dyn Fn(&MiddlewareContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync> {
        Box::new(move |_ctx| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push("terminal".to_string());
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn onion_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.push(Arc::new(Recorder {
            label: "outer",
            log: log.clone(),
        }));
        pipeline.push(Arc::new(Recorder {
            label: "inner",
            log: log.clone(),
        }));

        let terminal = recording_terminal(log.clone());
        let ran = pipeline.run(&mut ctx(), terminal.as_ref()).await.unwrap();

        assert!(ran);
        assert_eq!(
            *log.lock(),
            vec![
                "outer:before",
                "inner:before",
                "terminal",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[tokio::test]
    async fn drop_event_skips_downstream_and_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.push(Arc::new(Recorder {
            label: "outer",
            log: log.clone(),
        }));
        pipeline.push(Arc::new(Dropper));
        pipeline.push(Arc::new(Recorder {
            label: "unreached",
            log: log.clone(),
        }));

        let terminal = recording_terminal(log.clone());
        let ran = pipeline.run(&mut ctx(), terminal.as_ref()).await.unwrap();

        assert!(!ran, "dropped events must report false");
        assert_eq!(*log.lock(), vec!["outer:before", "outer:after"]);
    }

    #[tokio::test]
    async fn never_driving_next_is_a_programming_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.push(Arc::new(Stubborn));

        let terminal = recording_terminal(log.clone());
        let err = pipeline
            .run(&mut ctx(), terminal.as_ref())
            .await
            .expect_err("must be rejected");
        let err = err.downcast::<OutboxError>().unwrap();
        assert!(matches!(err, OutboxError::MiddlewareCompletion { .. }));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn middleware_errors_abort_the_chain() {
        struct Exploder;

        #[async_trait]
        impl Middleware for Exploder {
            async fn handle(
                &self,
                _ctx: &mut MiddlewareContext,
                _next: Next<'_>,
            ) -> anyhow::Result<()> {
                Err(anyhow::anyhow!("middleware exploded"))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.push(Arc::new(Exploder));

        let terminal = recording_terminal(log.clone());
        let err = pipeline
            .run(&mut ctx(), terminal.as_ref())
            .await
            .expect_err("must propagate");
        assert_eq!(err.to_string(), "middleware exploded");
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn event_mutations_reach_the_terminal() {
        struct Enricher;

        #[async_trait]
        impl Middleware for Enricher {
            async fn handle(
                &self,
                ctx: &mut MiddlewareContext,
                next: Next<'_>,
            ) -> anyhow::Result<()> {
                ctx.event.payload["enriched"] = serde_json::json!(true);
                next.run(ctx).await
            }
        }

        let seen = Arc::new(Mutex::new(serde_json::Value::Null));
        let mut pipeline = MiddlewarePipeline::default();
        pipeline.push(Arc::new(Enricher));

        let sink = seen.clone();
        let terminal: Box<Terminal> = Box::new(move |ctx| {
            let sink = sink.clone();
            let payload = ctx.event.payload.clone();
            Box::pin(async move {
                *sink.lock() = payload;
                Ok(())
            })
        });
        pipeline.run(&mut ctx(), terminal.as_ref()).await.unwrap();

        assert_eq!(*seen.lock(), serde_json::json!({ "enriched": true }));
    }
}
