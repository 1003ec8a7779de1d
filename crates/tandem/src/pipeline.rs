use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use uuid::Uuid;

use crate::context::{ExecutionContext, ExecutionResult};
use crate::error::EngineError;
use crate::message::{Message, Role};
use crate::middleware::{run_chain, Middleware};
use crate::ToolCall;

const DEFAULT_MAX_CONCURRENT: usize = 100;
const DEFAULT_STREAM_BUFFER: usize = 100;
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a stream terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFinish {
    Stop,
    Error,
    Interrupted,
}

impl StreamFinish {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFinish::Stop => "stop",
            StreamFinish::Error => "error",
            StreamFinish::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for StreamFinish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame of a pipeline run's output stream.
///
/// The engine sends exactly one terminating [`ExecutionChunk::Done`] per
/// stream, after which the channel closes. A normally-completed run's `Done`
/// carries the final result.
#[derive(Debug)]
pub enum ExecutionChunk {
    /// Content delta, optionally with the provider's delta token count.
    Content { delta: String, tokens: Option<u32> },
    /// A tool-call update surfaced mid-stream.
    ToolCall(ToolCall),
    /// An in-band error; a `Done` with finish `"error"` follows.
    Error(EngineError),
    /// Terminating chunk.
    Done {
        finish: StreamFinish,
        result: Option<Box<ExecutionResult>>,
    },
}

impl ExecutionChunk {
    /// The error carried by this chunk, if any.
    pub fn error(&self) -> Option<&EngineError> {
        match self {
            ExecutionChunk::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ExecutionChunk::Done { .. })
    }
}

/// Pipeline tuning. Zero-valued fields fall back to their defaults at
/// construction; capacities are `usize`, so the negative values the engine
/// would reject are unrepresentable here.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Admission semaphore capacity.
    pub max_concurrent_executions: usize,
    /// Capacity of the outbound chunk channel.
    pub stream_buffer_size: usize,
    /// Deadline applied by wrapping the caller's cancellation handle.
    pub execution_timeout: Duration,
    /// Maximum time `shutdown` waits for in-flight runs.
    pub graceful_shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: DEFAULT_MAX_CONCURRENT,
            stream_buffer_size: DEFAULT_STREAM_BUFFER,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            graceful_shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    fn normalized(mut self) -> Self {
        if self.max_concurrent_executions == 0 {
            self.max_concurrent_executions = DEFAULT_MAX_CONCURRENT;
        }
        if self.stream_buffer_size == 0 {
            self.stream_buffer_size = DEFAULT_STREAM_BUFFER;
        }
        if self.execution_timeout.is_zero() {
            self.execution_timeout = DEFAULT_EXECUTION_TIMEOUT;
        }
        if self.graceful_shutdown_timeout.is_zero() {
            self.graceful_shutdown_timeout = DEFAULT_SHUTDOWN_TIMEOUT;
        }
        self
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// The caller's cancellation handle; the engine derives the execution
    /// deadline from it.
    pub cancel: CancellationToken,
    /// Run identifier; generated when absent.
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl ExecuteOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }
}

/// Aborts the deadline timer when the run scope exits.
struct DeadlineGuard {
    handle: JoinHandle<()>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Derive a run token from the caller's handle, cancelled at `timeout`.
fn deadline_token(cancel: &CancellationToken, timeout: Duration) -> (CancellationToken, DeadlineGuard) {
    let token = cancel.child_token();
    let timer = token.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        timer.cancel();
    });
    (token, DeadlineGuard { handle })
}

struct Inner {
    config: PipelineConfig,
    chain: Arc<[Arc<dyn Middleware>]>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    shutdown_started: AtomicBool,
    tracker: TaskTracker,
}

/// The execution engine: admits requests, builds an [`ExecutionContext`],
/// drives the middleware chain, and returns the result once or as a stream.
///
/// Cheap to clone; clones share admission, shutdown, and configuration.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, chain: Vec<Arc<dyn Middleware>>) -> Self {
        let config = config.normalized();
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(config.max_concurrent_executions)),
                chain: Arc::from(chain),
                shutdown: CancellationToken::new(),
                shutdown_started: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Run the chain over a fresh user message and wait for the result.
    ///
    /// Fails fast with [`EngineError::ShuttingDown`] once shutdown has
    /// started, and with [`EngineError::AcquireFailed`] when the caller
    /// cancels while waiting for admission. An admitted run always yields a
    /// result; mid-chain failures are carried in
    /// [`ExecutionResult::first_error`].
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        role: Role,
        content: impl Into<String>,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute_with_options(ExecuteOptions::with_cancel(cancel), Some(role), content.into())
            .await
    }

    /// [`Pipeline::execute`] with explicit run/session/conversation ids.
    /// A `None` role suppresses the initial user-message append.
    pub async fn execute_with_options(
        &self,
        opts: ExecuteOptions,
        role: Option<Role>,
        content: String,
    ) -> Result<ExecutionResult, EngineError> {
        let initial = role.map(|r| Message::builder(r).content(content).build());
        self.execute_inner(opts, initial).await
    }

    /// Same contract with a preconstructed message, preserving its metadata,
    /// timestamp, tool calls, and validations.
    pub async fn execute_with_message(
        &self,
        cancel: CancellationToken,
        message: Message,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute_inner(ExecuteOptions::with_cancel(cancel), Some(message))
            .await
    }

    /// Streaming variant: returns the chunk channel immediately; admission
    /// and chain execution run on a background task. The channel always
    /// closes after the terminating chunk.
    pub fn execute_stream(
        &self,
        cancel: CancellationToken,
        role: Role,
        content: impl Into<String>,
    ) -> Result<mpsc::Receiver<ExecutionChunk>, EngineError> {
        let message = Message::builder(role).content(content.into()).build();
        self.execute_stream_inner(ExecuteOptions::with_cancel(cancel), Some(message))
    }

    /// Streaming variant of [`Pipeline::execute_with_message`].
    pub fn execute_stream_with_message(
        &self,
        cancel: CancellationToken,
        message: Message,
    ) -> Result<mpsc::Receiver<ExecutionChunk>, EngineError> {
        self.execute_stream_inner(ExecuteOptions::with_cancel(cancel), Some(message))
    }

    /// Stop accepting work and wait for in-flight runs to drain.
    ///
    /// Idempotent. Returns [`EngineError::ShutdownTimeout`] when draining
    /// exceeds the configured grace period; in-flight runs may continue past
    /// that point.
    pub async fn shutdown(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        if !self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.cancel();
            self.inner.tracker.close();
        }
        tokio::select! {
            _ = self.inner.tracker.wait() => Ok(()),
            _ = tokio::time::sleep(self.inner.config.graceful_shutdown_timeout) => {
                Err(EngineError::ShutdownTimeout(self.inner.config.graceful_shutdown_timeout))
            }
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::AcquireFailed(
                "cancelled before acquire".to_string(),
            ));
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::AcquireFailed(
                "cancelled while waiting for an execution slot".to_string(),
            )),
            _ = self.inner.shutdown.cancelled() => Err(EngineError::ShuttingDown),
            permit = Arc::clone(&self.inner.semaphore).acquire_owned() => {
                permit.map_err(|_| EngineError::ShuttingDown)
            }
        }
    }

    fn build_context(
        &self,
        run_token: CancellationToken,
        opts: &ExecuteOptions,
        stream_tx: Option<mpsc::Sender<ExecutionChunk>>,
    ) -> ExecutionContext {
        let run_id = opts
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut ctx =
            ExecutionContext::new(run_token, run_id, Arc::clone(&self.inner.chain), stream_tx);
        ctx.session_id = opts.session_id.clone();
        ctx.conversation_id = opts.conversation_id.clone();
        ctx
    }

    async fn drive(&self, ctx: &mut ExecutionContext) {
        if let Err(err) = run_chain(&self.inner.chain, 0, ctx).await {
            debug!(run_id = %ctx.run_id, error = %err, "chain unwound with error");
        }
        if ctx.is_cancelled() && ctx.first_error().is_none() {
            ctx.capture_error(&EngineError::Cancelled);
        }
    }

    async fn execute_inner(
        &self,
        opts: ExecuteOptions,
        initial: Option<Message>,
    ) -> Result<ExecutionResult, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let permit = self.acquire(&opts.cancel).await?;
        let (run_token, _deadline) =
            deadline_token(&opts.cancel, self.inner.config.execution_timeout);

        let run = async {
            let mut ctx = self.build_context(run_token, &opts, None);
            if let Some(message) = initial {
                ctx.push_message(message);
            }
            self.drive(&mut ctx).await;
            ctx.into_result()
        };
        let result = self.inner.tracker.track_future(run).await;
        drop(permit);
        Ok(result)
    }

    fn execute_stream_inner(
        &self,
        opts: ExecuteOptions,
        initial: Option<Message>,
    ) -> Result<mpsc::Receiver<ExecutionChunk>, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let (tx, rx) = mpsc::channel(self.inner.config.stream_buffer_size);

        let this = self.clone();
        self.inner.tracker.spawn(async move {
            // Admission happens here so a rejected or cancelled acquire is
            // reported as an error chunk instead of a blocked caller.
            let permit = match this.acquire(&opts.cancel).await {
                Ok(permit) => permit,
                Err(err) => {
                    let _ = tx.send(ExecutionChunk::Error(err)).await;
                    let _ = tx
                        .send(ExecutionChunk::Done {
                            finish: StreamFinish::Error,
                            result: None,
                        })
                        .await;
                    return;
                }
            };

            let (run_token, _deadline) =
                deadline_token(&opts.cancel, this.inner.config.execution_timeout);
            let mut ctx = this.build_context(run_token, &opts, Some(tx.clone()));
            if let Some(message) = initial {
                ctx.push_message(message);
            }
            this.drive(&mut ctx).await;

            let interrupted = ctx.stream_interrupted().is_some();
            let result = ctx.into_result();
            if interrupted {
                let _ = tx
                    .send(ExecutionChunk::Done {
                        finish: StreamFinish::Interrupted,
                        result: None,
                    })
                    .await;
            } else if let Some(err) = result.first_error.clone() {
                let _ = tx.send(ExecutionChunk::Error(err)).await;
                let _ = tx
                    .send(ExecutionChunk::Done {
                        finish: StreamFinish::Error,
                        result: None,
                    })
                    .await;
            } else {
                let _ = tx
                    .send(ExecutionChunk::Done {
                        finish: StreamFinish::Stop,
                        result: Some(Box::new(result)),
                    })
                    .await;
            }
            drop(permit);
        });

        Ok(rx)
    }
}
