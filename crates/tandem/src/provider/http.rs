//! Transport-agnostic HTTP wire contract.
//!
//! Wire-dialect adapters implement request builders and response parsers
//! over `http` types; [`HttpBackedProvider`] lifts any such adapter into the
//! async capability traits by executing the exchanges through
//! [`crate::outbound`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::Response;
use crate::error::EngineError;
use crate::message::Message;
use crate::outbound::{call_outbound, open_stream, SseLineBuffer};
use crate::provider::{
    EmbeddingProvider, MultimodalProvider, PredictProvider, ProviderChunk, ProviderStream,
    Tool, ToolChoice, ToolProvider,
};
use crate::stt::{SttRequest, SttResponse};
use crate::tts::{TtsRequest, TtsResponse};
use crate::{ToolCall, Usage};

/// Buffer of the channel carrying parsed provider chunks.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Chat-prediction wire dialect.
pub trait HttpPredictProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Build the prediction request. `stream` selects the SSE variant.
    fn predict_request(
        &self,
        messages: &[Message],
        tools: Option<&[Tool]>,
        tool_choice: Option<&ToolChoice>,
        stream: bool,
    ) -> Result<http::Request<Vec<u8>>, EngineError>;

    fn parse_predict(&self, response: http::Response<Vec<u8>>) -> Result<Response, EngineError>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Parse one SSE line into zero or more chunks. A
    /// [`EngineError::StreamParse`] return means the frame is skipped and
    /// the stream continues.
    fn parse_stream_frame(&self, line: &[u8]) -> Result<Vec<ProviderChunk>, EngineError> {
        let _ = line;
        Ok(Vec::new())
    }

    /// MIME types accepted in media parts; empty means text-only.
    fn accepted_mime_types(&self) -> &[&str] {
        &[]
    }

    /// Per-image payload cap in bytes.
    fn max_image_bytes(&self) -> usize {
        0
    }
}

/// Embeddings wire dialect.
pub trait HttpEmbeddingProvider: Send + Sync {
    fn embed_request(
        &self,
        inputs: &[String],
        model: Option<&str>,
    ) -> Result<http::Request<Vec<u8>>, EngineError>;

    fn parse_embed(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<(Vec<Vec<f32>>, Usage), EngineError>;

    fn dimensions(&self) -> usize;

    fn max_batch_size(&self) -> usize;
}

/// Speech-to-text and text-to-speech wire dialect.
pub trait HttpAudioProvider: Send + Sync {
    fn stt_request(&self, req: &SttRequest) -> Result<http::Request<Vec<u8>>, EngineError>;

    fn parse_stt(&self, response: http::Response<Vec<u8>>) -> Result<SttResponse, EngineError>;

    fn tts_request(&self, req: &TtsRequest) -> Result<http::Request<Vec<u8>>, EngineError>;

    fn parse_tts(&self, response: http::Response<Vec<u8>>) -> Result<TtsResponse, EngineError>;
}

/// The full wire surface of an HTTP provider.
pub trait HttpProvider: HttpPredictProvider + HttpEmbeddingProvider + HttpAudioProvider {}

impl<T: HttpPredictProvider + HttpEmbeddingProvider + HttpAudioProvider> HttpProvider for T {}

/// Lifts a wire dialect into the async capability traits.
pub struct HttpBackedProvider {
    inner: Arc<dyn HttpProvider>,
}

impl HttpBackedProvider {
    pub fn new(inner: Arc<dyn HttpProvider>) -> Self {
        Self { inner }
    }

    async fn do_predict(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tools: Option<&[Tool]>,
        choice: Option<&ToolChoice>,
    ) -> Result<Response, EngineError> {
        let req = self.inner.predict_request(messages, tools, choice, false)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            resp = call_outbound(req) => self.inner.parse_predict(resp?),
        }
    }

    /// Open an SSE exchange and scan it into a chunk channel on a detached
    /// task. The scanner skips malformed frames and stops with a
    /// [`ProviderChunk::Cancelled`] when the caller cancels.
    async fn open_sse(
        &self,
        cancel: &CancellationToken,
        req: http::Request<Vec<u8>>,
    ) -> Result<ProviderStream, EngineError> {
        let mut byte_stream = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            opened = open_stream(req) => opened?,
        };

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = SseLineBuffer::new();
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Ok(ProviderChunk::Cancelled)).await;
                        return;
                    }
                    item = byte_stream.next() => item,
                };
                match item {
                    Some(Ok(bytes)) => {
                        for line in lines.push(&bytes) {
                            match inner.parse_stream_frame(line.as_bytes()) {
                                Ok(chunks) => {
                                    for chunk in chunks {
                                        if tx.send(Ok(chunk)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(err @ EngineError::StreamParse(_)) => {
                                    debug!(error = %err, "skipping malformed stream frame");
                                }
                                Err(err) => {
                                    let _ = tx.send(Err(err)).await;
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(err)) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    None => return,
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl PredictProvider for HttpBackedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn predict(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<Response, EngineError> {
        self.do_predict(cancel, messages, None, None).await
    }

    fn supports_streaming(&self) -> bool {
        self.inner.supports_streaming()
    }

    async fn predict_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<ProviderStream, EngineError> {
        if !self.inner.supports_streaming() {
            return Err(EngineError::NotImplemented(
                "streaming prediction".to_string(),
            ));
        }
        let req = self.inner.predict_request(messages, None, None, true)?;
        self.open_sse(cancel, req).await
    }
}

#[async_trait]
impl ToolProvider for HttpBackedProvider {
    fn build_tooling(&self, tools: &[Tool]) -> Result<Value, EngineError> {
        Ok(serde_json::to_value(tools)?)
    }

    async fn predict_with_tools(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tooling: &Value,
        choice: &ToolChoice,
    ) -> Result<(Response, Vec<ToolCall>), EngineError> {
        let tools: Vec<Tool> = serde_json::from_value(tooling.clone())?;
        let response = self
            .do_predict(cancel, messages, Some(&tools), Some(choice))
            .await?;
        let calls = response.tool_calls.clone();
        Ok((response, calls))
    }

    async fn predict_stream_with_tools(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tooling: &Value,
        choice: &ToolChoice,
    ) -> Result<ProviderStream, EngineError> {
        if !self.inner.supports_streaming() {
            return Err(EngineError::NotImplemented(
                "streaming tool prediction".to_string(),
            ));
        }
        let tools: Vec<Tool> = serde_json::from_value(tooling.clone())?;
        let req = self
            .inner
            .predict_request(messages, Some(&tools), Some(choice), true)?;
        self.open_sse(cancel, req).await
    }
}

#[async_trait]
impl MultimodalProvider for HttpBackedProvider {
    fn accepted_mime_types(&self) -> &[&str] {
        self.inner.accepted_mime_types()
    }

    fn max_image_bytes(&self) -> usize {
        self.inner.max_image_bytes()
    }

    async fn predict_multimodal(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<Response, EngineError> {
        self.do_predict(cancel, messages, None, None).await
    }

    async fn predict_multimodal_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<ProviderStream, EngineError> {
        self.predict_stream(cancel, messages).await
    }
}

#[async_trait]
impl EmbeddingProvider for HttpBackedProvider {
    async fn embed(
        &self,
        cancel: &CancellationToken,
        inputs: &[String],
        model: Option<&str>,
    ) -> Result<(Vec<Vec<f32>>, Usage), EngineError> {
        if inputs.len() > self.inner.max_batch_size() {
            return Err(EngineError::InvalidRequest(format!(
                "embedding batch of {} exceeds maximum {}",
                inputs.len(),
                self.inner.max_batch_size()
            )));
        }
        let req = self.inner.embed_request(inputs, model)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            resp = call_outbound(req) => self.inner.parse_embed(resp?),
        }
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }
}

impl HttpBackedProvider {
    /// Transcribe audio through the adapter's STT endpoint.
    pub async fn transcribe(
        &self,
        cancel: &CancellationToken,
        req: &SttRequest,
    ) -> Result<SttResponse, EngineError> {
        let wire = self.inner.stt_request(req)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            resp = call_outbound(wire) => self.inner.parse_stt(resp?),
        }
    }

    /// Synthesize speech through the adapter's TTS endpoint.
    pub async fn speak(
        &self,
        cancel: &CancellationToken,
        req: &TtsRequest,
    ) -> Result<TtsResponse, EngineError> {
        let wire = self.inner.tts_request(req)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            resp = call_outbound(wire) => self.inner.parse_tts(resp?),
        }
    }
}
