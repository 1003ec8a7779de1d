//! Execution substrate for LLM applications: a middleware pipeline engine,
//! the provider adapter contract it drives, and the supporting data model.
//!
//! # Overview
//! The crate is organized around three pieces:
//!
//! - A [`pipeline::Pipeline`] admits requests, threads an
//!   [`context::ExecutionContext`] through an onion-composed middleware
//!   chain, and returns an [`context::ExecutionResult`] once or as a
//!   stream of [`pipeline::ExecutionChunk`]s.
//! - Provider adapters implement the capability traits in [`provider`]
//!   (predict, streaming, tools, multimodal, embeddings, streaming-input
//!   sessions) and are driven through a transport-agnostic HTTP wire layer.
//! - The trace model in [`trace`] records every LLM call and event of a run
//!   together with aggregate cost.

use serde::{Deserialize, Serialize};

pub mod context;
pub mod error;
pub mod message;
pub mod middleware;
pub mod outbound;
pub mod pipeline;
pub mod predict;
pub mod pricing;
pub mod provider;
pub mod stt;
pub mod trace;
pub mod tts;

pub use context::{ExecutionContext, ExecutionResult, Response};
pub use error::EngineError;
pub use message::{ContentPart, Message, Role};
pub use middleware::{Middleware, Next};
pub use pipeline::{ExecutionChunk, Pipeline, PipelineConfig, StreamFinish};
pub use predict::PredictMiddleware;
pub use trace::{CostInfo, ExecutionTrace, LlmCall, TraceEvent};

/// A function call an LLM wants to make. The same structure is used across
/// providers; `arguments` is carried as the raw JSON string the vendor sent.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

/// Which function to call and with what arguments.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments to pass, as the vendor's JSON text. Never round-tripped
    /// through a map so vendor-specific formatting survives.
    pub arguments: String,
}

/// Token usage reported by a provider, accepting the field names of the
/// major vendor dialects.
#[derive(Debug, Serialize, Deserialize, Clone, Default, Eq, PartialEq)]
pub struct Usage {
    /// Number of input tokens.
    #[serde(
        alias = "prompt_tokens",     // OpenAI-compatible
        alias = "prompt_eval_count", // Ollama
        alias = "promptTokenCount"   // Google
    )]
    pub input_tokens: u32,
    /// Number of output tokens.
    #[serde(
        alias = "completion_tokens",   // OpenAI-compatible
        alias = "eval_count",          // Ollama
        alias = "candidatesTokenCount" // Google
    )]
    pub output_tokens: u32,
    /// Tokens served from a prompt cache, when the dialect reports them.
    #[serde(default, alias = "cached_tokens")]
    pub cached_tokens: u32,
}
