//! The LLM-invoking middleware: drives a provider from the chain, records
//! the call on the trace, and appends the assistant message.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use crate::context::{ExecutionContext, Response};
use crate::error::EngineError;
use crate::message::{Message, Role};
use crate::middleware::{Middleware, Next};
use crate::pipeline::ExecutionChunk;
use crate::pricing::ModelRates;
use crate::provider::{PredictProvider, ProviderChunk};
use crate::trace::CostInfo;
use crate::{ToolCall, Usage};

/// Terminal middleware that sends the context's message history to a
/// provider.
///
/// In streaming mode (and with a streaming-capable provider) the response
/// is forwarded delta by delta through [`ExecutionContext::emit_stream_chunk`];
/// otherwise a single prediction runs. Either way the call lands on the
/// trace with the message index of the assistant message appended right
/// after it.
pub struct PredictMiddleware {
    provider: Arc<dyn PredictProvider>,
    rates: Option<ModelRates>,
    disable_trace: bool,
}

impl PredictMiddleware {
    pub fn new(provider: Arc<dyn PredictProvider>) -> Self {
        Self {
            provider,
            rates: None,
            disable_trace: false,
        }
    }

    /// Price calls with these rates instead of trusting the provider's
    /// reported cost.
    pub fn rates(mut self, rates: ModelRates) -> Self {
        self.rates = Some(rates);
        self
    }

    /// Suppress trace recording for this middleware.
    pub fn without_trace(mut self) -> Self {
        self.disable_trace = true;
        self
    }

    fn cost_info(&self, response: &Response) -> CostInfo {
        match self.rates {
            Some(rates) => rates.cost(response.input_tokens, response.output_tokens, 0),
            None => CostInfo {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
                total_cost: response.cost,
                ..Default::default()
            },
        }
    }

    async fn predict_streaming(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<Response, EngineError> {
        let start = Instant::now();
        let mut rx = self
            .provider
            .predict_stream(ctx.cancellation(), &ctx.messages)
            .await?;

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = Usage::default();

        while let Some(item) = rx.recv().await {
            match item? {
                ProviderChunk::Text(delta) => {
                    content.push_str(&delta);
                    ctx.emit_stream_chunk(ExecutionChunk::Content {
                        delta,
                        tokens: None,
                    })
                    .await?;
                }
                ProviderChunk::ToolCallComplete { tool_call, .. } => {
                    ctx.emit_stream_chunk(ExecutionChunk::ToolCall(tool_call.clone()))
                        .await?;
                    tool_calls.push(tool_call);
                }
                ProviderChunk::Usage(reported) => usage = reported,
                ProviderChunk::Done { finish_reason } => {
                    debug!(finish_reason, "provider stream finished");
                    break;
                }
                ProviderChunk::Cancelled => return Err(EngineError::Cancelled),
                ProviderChunk::ToolCallStart { .. } | ProviderChunk::ToolCallDelta { .. } => {}
            }
        }

        Ok(Response {
            role: Role::Assistant,
            content,
            tool_calls,
            final_response: None,
            provider: self.provider.name().to_string(),
            model: self.provider.model().to_string(),
            latency: start.elapsed(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost: 0.0,
        })
    }
}

#[async_trait]
impl Middleware for PredictMiddleware {
    fn name(&self) -> &str {
        "predict"
    }

    async fn process(
        &self,
        ctx: &mut ExecutionContext,
        next: &Next<'_>,
    ) -> Result<(), EngineError> {
        let started_at = OffsetDateTime::now_utc();
        let start = Instant::now();

        let outcome = if ctx.is_streaming() && self.provider.supports_streaming() {
            self.predict_streaming(ctx).await
        } else {
            self.provider
                .predict(ctx.cancellation(), &ctx.messages)
                .await
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => {
                ctx.record_llm_call(
                    self.disable_trace,
                    None,
                    started_at,
                    start.elapsed(),
                    None,
                    Some(&err),
                );
                return Err(err);
            }
        };
        response.latency = start.elapsed();

        let cost = self.cost_info(&response);
        response.cost = cost.total_cost;

        ctx.record_llm_call(
            self.disable_trace,
            Some(&response),
            started_at,
            response.latency,
            Some(cost),
            None,
        );
        ctx.push_message(
            Message::assistant()
                .content(response.content.clone())
                .tool_calls(response.tool_calls.clone())
                .build(),
        );
        ctx.response = Some(response);

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, PipelineConfig, StreamFinish};
    use crate::provider::ProviderStream;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct CannedProvider {
        content: &'static str,
        streaming: bool,
        fail: bool,
    }

    #[async_trait]
    impl PredictProvider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }

        fn model(&self) -> &str {
            "canned-1"
        }

        async fn predict(
            &self,
            _cancel: &CancellationToken,
            _messages: &[Message],
        ) -> Result<Response, EngineError> {
            if self.fail {
                return Err(EngineError::Provider("provider down".into()));
            }
            Ok(Response {
                role: Role::Assistant,
                content: self.content.to_string(),
                tool_calls: Vec::new(),
                final_response: None,
                provider: "canned".into(),
                model: "canned-1".into(),
                latency: Duration::ZERO,
                input_tokens: 10,
                output_tokens: 20,
                cost: 0.0,
            })
        }

        fn supports_streaming(&self) -> bool {
            self.streaming
        }

        async fn predict_stream(
            &self,
            _cancel: &CancellationToken,
            _messages: &[Message],
        ) -> Result<ProviderStream, EngineError> {
            let (tx, rx) = mpsc::channel(8);
            let content = self.content;
            tokio::spawn(async move {
                for piece in content.split_inclusive(' ') {
                    let _ = tx.send(Ok(ProviderChunk::Text(piece.to_string()))).await;
                }
                let _ = tx
                    .send(Ok(ProviderChunk::Usage(Usage {
                        input_tokens: 10,
                        output_tokens: 20,
                        cached_tokens: 0,
                    })))
                    .await;
                let _ = tx
                    .send(Ok(ProviderChunk::Done {
                        finish_reason: "stop".to_string(),
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    fn chain(provider: CannedProvider) -> Pipeline {
        let middleware =
            PredictMiddleware::new(Arc::new(provider)).rates(ModelRates {
                input_per_mtok: 1.0,
                output_per_mtok: 2.0,
                cached_input_per_mtok: 0.0,
            });
        Pipeline::new(PipelineConfig::default(), vec![Arc::new(middleware)])
    }

    #[tokio::test]
    async fn prediction_lands_on_trace_and_history() {
        let p = chain(CannedProvider {
            content: "the answer",
            streaming: false,
            fail: false,
        });

        let result = p
            .execute(CancellationToken::new(), Role::User, "question")
            .await
            .unwrap();

        assert!(result.first_error.is_none());
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[1].role, Role::Assistant);
        assert_eq!(result.messages[1].text(), "the answer");

        let call = &result.trace.llm_calls[0];
        assert_eq!(call.sequence, 1);
        assert_eq!(call.message_index, 1);
        assert_eq!(result.response.as_ref().unwrap().model, "canned-1");
        assert!(result.total_cost.total_cost > 0.0);
    }

    #[tokio::test]
    async fn streaming_prediction_forwards_deltas() {
        let p = chain(CannedProvider {
            content: "one two three",
            streaming: true,
            fail: false,
        });

        let mut rx = p
            .execute_stream(CancellationToken::new(), Role::User, "count")
            .unwrap();

        let mut assembled = String::new();
        let mut finish = None;
        let mut final_result = None;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                ExecutionChunk::Content { delta, .. } => assembled.push_str(&delta),
                ExecutionChunk::Done { finish: f, result } => {
                    finish = Some(f);
                    final_result = result;
                }
                other => panic!("unexpected chunk: {other:?}"),
            }
        }

        assert_eq!(assembled, "one two three");
        assert_eq!(finish, Some(StreamFinish::Stop));
        let result = final_result.unwrap();
        assert_eq!(result.messages[1].text(), "one two three");
        assert_eq!(result.trace.llm_calls[0].message_index, 1);
    }

    #[tokio::test]
    async fn provider_failure_is_recorded_and_captured() {
        let p = chain(CannedProvider {
            content: "",
            streaming: false,
            fail: true,
        });

        let result = p
            .execute(CancellationToken::new(), Role::User, "question")
            .await
            .unwrap();

        assert_eq!(
            result.first_error,
            Some(EngineError::Provider("provider down".into()))
        );
        let call = &result.trace.llm_calls[0];
        assert!(call.error.as_ref().unwrap().contains("provider down"));
        // No assistant message was appended for the failed call.
        assert_eq!(result.messages.len(), 1);
    }
}
