use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::message::{Message, Role, ToolResultBlock};
use crate::middleware::Middleware;
use crate::pipeline::ExecutionChunk;
use crate::provider::Tool;
use crate::trace::{CostInfo, ExecutionTrace, LlmCall};
use crate::ToolCall;

/// Assistant output snapshot produced by one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Post-tool text, when the provider answered again after tool results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    pub provider: String,
    pub model: String,
    pub latency: Duration,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost: f64,
}

/// Immutable return value of one pipeline run.
///
/// Always produced for an admitted run; a failing run carries its first
/// error here together with whatever partial state the chain built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    pub trace: ExecutionTrace,
    pub total_cost: CostInfo,
    pub metadata: HashMap<String, Value>,
    /// The first error captured during the run, if any.
    #[serde(skip)]
    pub first_error: Option<EngineError>,
}

/// Mutable state for one run through the middleware chain.
///
/// Created by the engine on entry and exclusively owned by the chain until
/// the final middleware returns; middleware that spawn work must
/// synchronise back before returning.
pub struct ExecutionContext {
    cancel: CancellationToken,
    pub run_id: String,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub system_prompt: Option<String>,
    pub variables: HashMap<String, String>,
    /// Tool names the run is allowed to invoke; empty means unrestricted.
    pub allowed_tools: Vec<String>,
    /// Ordered message history.
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub tool_results: Vec<ToolResultBlock>,
    /// Tool calls awaiting external completion.
    pub pending_tool_calls: Vec<ToolCall>,
    /// The assembled prompt, when a middleware materializes one.
    pub prompt: Option<String>,
    pub trace: ExecutionTrace,
    /// Most recent provider response.
    pub response: Option<Response>,
    pub metadata: HashMap<String, Value>,
    first_error: Option<EngineError>,
    streaming: bool,
    stream_tx: Option<mpsc::Sender<ExecutionChunk>>,
    stream_interrupted: bool,
    stream_interrupt_reason: Option<String>,
    short_circuit: bool,
    chain: Arc<[Arc<dyn Middleware>]>,
}

impl ExecutionContext {
    pub(crate) fn new(
        cancel: CancellationToken,
        run_id: String,
        chain: Arc<[Arc<dyn Middleware>]>,
        stream_tx: Option<mpsc::Sender<ExecutionChunk>>,
    ) -> Self {
        let streaming = stream_tx.is_some();
        Self {
            cancel,
            run_id,
            session_id: None,
            conversation_id: None,
            system_prompt: None,
            variables: HashMap::new(),
            allowed_tools: Vec::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            tool_results: Vec::new(),
            pending_tool_calls: Vec::new(),
            prompt: None,
            trace: ExecutionTrace::new(),
            response: None,
            metadata: HashMap::new(),
            first_error: None,
            streaming,
            stream_tx,
            stream_interrupted: false,
            stream_interrupt_reason: None,
            short_circuit: false,
            chain,
        }
    }

    /// The cancellation handle for this run. Middleware check it at
    /// suspension points.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// The first error captured during this run.
    pub fn first_error(&self) -> Option<&EngineError> {
        self.first_error.as_ref()
    }

    /// Capture `err` as the run's first error unless one is already set.
    pub fn capture_error(&mut self, err: &EngineError) {
        if self.first_error.is_none() {
            self.first_error = Some(err.clone());
        }
    }

    /// Mark the chain as deliberately short-circuited so the engine does not
    /// warn when the continuation is left uninvoked.
    pub fn set_short_circuit(&mut self) {
        self.short_circuit = true;
    }

    pub fn is_short_circuited(&self) -> bool {
        self.short_circuit
    }

    /// Whether a stream hook interrupted the stream, and why.
    pub fn stream_interrupted(&self) -> Option<&str> {
        if self.stream_interrupted {
            Some(self.stream_interrupt_reason.as_deref().unwrap_or(""))
        } else {
            None
        }
    }

    /// Interrupt the stream. Subsequent emissions fail with `Cancelled` and
    /// the terminating chunk carries finish-reason `"interrupted"`.
    pub fn interrupt_stream(&mut self, reason: impl Into<String>) {
        if !self.stream_interrupted {
            self.stream_interrupted = true;
            self.stream_interrupt_reason = Some(reason.into());
        }
    }

    /// Emit an intermediate chunk on the run's output channel.
    ///
    /// The chunk first passes through every middleware's stream hook in
    /// chain order, then is sent on the channel, blocking on a select
    /// between the send and cancellation when the buffer is full. Returns
    /// `Cancelled` when the run was cancelled or the stream interrupted;
    /// the producing middleware should stop emitting.
    pub async fn emit_stream_chunk(&mut self, chunk: ExecutionChunk) -> Result<(), EngineError> {
        let Some(tx) = self.stream_tx.clone() else {
            return Ok(());
        };
        if self.stream_interrupted {
            return Err(EngineError::Cancelled);
        }

        let mut chunk = chunk;
        let chain = Arc::clone(&self.chain);
        for mw in chain.iter() {
            mw.on_stream_chunk(self, &mut chunk).await?;
            if self.stream_interrupted {
                return Err(EngineError::Cancelled);
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            sent = tx.send(chunk) => sent.map_err(|_| EngineError::Cancelled),
        }
    }

    /// Record one LLM invocation on the trace.
    ///
    /// Rejected when `disable_trace` is set. The record's `message_index` is
    /// the current message-history length: the caller appends the assistant
    /// message immediately after recording, which is what attaches trace to
    /// message.
    pub fn record_llm_call(
        &mut self,
        disable_trace: bool,
        response: Option<&Response>,
        started_at: OffsetDateTime,
        duration: Duration,
        cost: Option<CostInfo>,
        error: Option<&EngineError>,
    ) {
        if disable_trace {
            debug!(run_id = %self.run_id, "trace disabled; dropping llm call record");
            return;
        }
        self.trace.push_llm_call(LlmCall {
            sequence: 0, // assigned by the trace
            message_index: self.messages.len(),
            started_at,
            duration,
            cost,
            tool_calls: response.map(|r| r.tool_calls.clone()).unwrap_or_default(),
            error: error.map(|e| e.to_string()),
            raw_request: None,
            raw_response: None,
        });
    }

    /// Append a message to the history.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub(crate) fn into_result(mut self) -> ExecutionResult {
        self.trace.complete();
        let total_cost = self.trace.total_cost();
        ExecutionResult {
            messages: self.messages,
            response: self.response,
            trace: self.trace,
            total_cost,
            metadata: self.metadata,
            first_error: self.first_error,
        }
    }
}
