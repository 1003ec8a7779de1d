use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::pipeline::ExecutionChunk;

/// A unit of the pipeline chain.
///
/// `process` runs once per execution and receives the continuation for the
/// rest of the chain; calling it zero times short-circuits, calling it once
/// is the normal path. `on_stream_chunk` runs for every chunk emitted while
/// streaming and may inspect, mutate, or interrupt the stream via
/// [`ExecutionContext::interrupt_stream`].
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Human-readable name used in diagnostics.
    fn name(&self) -> &str;

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        next: &Next<'_>,
    ) -> Result<(), EngineError>;

    async fn on_stream_chunk(
        &self,
        _ctx: &mut ExecutionContext,
        _chunk: &mut ExecutionChunk,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// The continuation handed to a middleware: runs the remainder of the chain.
///
/// Invocation counts are tracked per frame so the engine can warn about a
/// continuation that was never invoked or invoked more than once. Both are
/// diagnostics only; execution proceeds either way.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    index: usize,
    calls: AtomicU32,
}

impl Next<'_> {
    /// Run the remainder of the chain.
    pub async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        run_chain(self.chain, self.index + 1, ctx).await
    }

    fn times_called(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Drive the chain from `index`, monitoring each frame's continuation use.
///
/// On error the frame captures it as the context's first error (if none was
/// captured deeper) and unwinds; middleware after the failing step never
/// run.
pub(crate) fn run_chain<'a>(
    chain: &'a [Arc<dyn Middleware>],
    index: usize,
    ctx: &'a mut ExecutionContext,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        if index >= chain.len() {
            return Ok(());
        }
        let mw = &chain[index];
        let next = Next {
            chain,
            index,
            calls: AtomicU32::new(0),
        };

        let result = mw.process(ctx, &next).await;

        let calls = next.times_called();
        if calls > 1 {
            warn!(
                middleware = mw.name(),
                calls, "continuation invoked more than once"
            );
        }
        match result {
            Ok(()) => {
                if calls == 0 && index + 1 < chain.len() && !ctx.is_short_circuited() {
                    warn!(
                        middleware = mw.name(),
                        "chain broken: continuation not invoked and no error returned"
                    );
                }
                Ok(())
            }
            Err(err) => {
                ctx.capture_error(&err);
                Err(err)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    /// Appends `<name>-before` / `<name>-after` around the continuation into
    /// the context metadata under `"order"`.
    struct Bracketing {
        name: &'static str,
        fail: bool,
    }

    fn record(ctx: &mut ExecutionContext, entry: String) {
        let order = ctx
            .metadata
            .entry("order".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        order.as_array_mut().unwrap().push(entry.into());
    }

    #[async_trait]
    impl Middleware for Bracketing {
        fn name(&self) -> &str {
            self.name
        }

        async fn process(
            &self,
            ctx: &mut ExecutionContext,
            next: &Next<'_>,
        ) -> Result<(), EngineError> {
            record(ctx, format!("{}-before", self.name));
            if self.fail {
                return Err(EngineError::Provider("boom".into()));
            }
            let result = next.run(ctx).await;
            record(ctx, format!("{}-after", self.name));
            result
        }
    }

    fn chain(entries: &[(&'static str, bool)]) -> Vec<Arc<dyn Middleware>> {
        entries
            .iter()
            .map(|&(name, fail)| Arc::new(Bracketing { name, fail }) as Arc<dyn Middleware>)
            .collect()
    }

    fn ctx(chain: &[Arc<dyn Middleware>]) -> ExecutionContext {
        ExecutionContext::new(
            CancellationToken::new(),
            "test".to_string(),
            Arc::from(chain.to_vec()),
            None,
        )
    }

    fn order(ctx: &ExecutionContext) -> Vec<String> {
        ctx.metadata["order"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn onion_order_nests_before_and_after() {
        let chain = chain(&[("a", false), ("b", false), ("c", false)]);
        let mut ctx = ctx(&chain);

        run_chain(&chain, 0, &mut ctx).await.unwrap();

        assert_eq!(
            order(&ctx),
            vec!["a-before", "b-before", "c-before", "c-after", "b-after", "a-after"]
        );
    }

    #[tokio::test]
    async fn error_short_circuits_but_unwinds_cleanup() {
        let chain = chain(&[("a", false), ("b", true), ("c", false)]);
        let mut ctx = ctx(&chain);

        let err = run_chain(&chain, 0, &mut ctx).await.unwrap_err();

        assert_eq!(err, EngineError::Provider("boom".into()));
        assert_eq!(ctx.first_error(), Some(&err));
        // c never ran; a's cleanup after the continuation did.
        assert_eq!(order(&ctx), vec!["a-before", "b-before", "a-after"]);
    }

    #[tokio::test]
    async fn double_continuation_runs_rest_twice() {
        struct Doubler;

        #[async_trait]
        impl Middleware for Doubler {
            fn name(&self) -> &str {
                "doubler"
            }

            async fn process(
                &self,
                ctx: &mut ExecutionContext,
                next: &Next<'_>,
            ) -> Result<(), EngineError> {
                next.run(ctx).await?;
                next.run(ctx).await
            }
        }

        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Doubler),
            Arc::new(Bracketing {
                name: "tail",
                fail: false,
            }),
        ];
        let mut ctx = ctx(&chain);

        run_chain(&chain, 0, &mut ctx).await.unwrap();

        assert_eq!(
            order(&ctx),
            vec!["tail-before", "tail-after", "tail-before", "tail-after"]
        );
    }
}
