//! Reference OpenAI-compatible adapter.
//!
//! Speaks the chat/completions wire dialect (JSON request/response plus SSE
//! streaming) against `api.openai.com` or any compatible endpoint, vLLM
//! included via the passthrough extension options.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use tandem::error::EngineError;
use tandem::message::Message;
use tandem::pricing::ModelRates;
use tandem::provider::http::{HttpAudioProvider, HttpEmbeddingProvider, HttpPredictProvider};
use tandem::provider::{CostCalculator, ProviderChunk, Tool, ToolChoice};
use tandem::stt::{SttRequest, SttResponse};
use tandem::trace::CostInfo;
use tandem::tts::{TtsRequest, TtsResponse};
use tandem::Usage;

pub mod api;

const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;
const MAX_EMBEDDING_BATCH: usize = 2048;
const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

const ACCEPTED_IMAGE_MIME_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/gif", "image/webp"];

fn normalize_base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let p = url.path().to_string();
        url.set_path(&(p + "/"));
    }
    url
}

fn deserialize_base_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let url = Url::deserialize(deserializer)?;
    Ok(normalize_base_url(url))
}

/// vLLM extension options, flattened into the request body when configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct VllmOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_beam_search: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_of: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_eos: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_special_tokens: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guided_json: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guided_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guided_grammar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guided_choice: Option<Vec<String>>,
}

/// Adapter configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct OpenAi {
    /// Bearer key; omitted from the request when empty (self-hosted
    /// endpoints).
    #[serde(default)]
    pub api_key: String,
    #[serde(
        default = "OpenAi::default_base_url",
        deserialize_with = "deserialize_base_url"
    )]
    pub base_url: Url,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// System prompt prepended when the history lacks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_encoding_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rates: Option<ModelRates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vllm: Option<VllmOptions>,
    /// Streaming tool-call assembly state, keyed by delta index.
    #[serde(skip)]
    tool_state: Mutex<HashMap<usize, api::ToolDeltaState>>,
}

impl OpenAi {
    fn default_base_url() -> Url {
        Url::parse("https://api.openai.com/v1/").unwrap()
    }

    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_key: String::new(),
            base_url: Self::default_base_url(),
            model: model.into(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            seed: None,
            system: None,
            tools: None,
            tool_choice: None,
            embedding_encoding_format: None,
            embedding_dimensions: None,
            rates: None,
            vllm: None,
            tool_state: Mutex::new(HashMap::new()),
        }
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn base_url(mut self, base_url: Url) -> Self {
        self.base_url = normalize_base_url(base_url);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn rates(mut self, rates: ModelRates) -> Self {
        self.rates = Some(rates);
        self
    }

    pub fn vllm(mut self, vllm: VllmOptions) -> Self {
        self.vllm = Some(vllm);
        self
    }

    /// Build an adapter from a JSON configuration value.
    pub fn from_config(config: &serde_json::Value) -> Result<Self, EngineError> {
        let mut provider: OpenAi = serde_json::from_value(config.clone())?;
        provider.base_url = normalize_base_url(provider.base_url);
        Ok(provider)
    }
}

impl HttpPredictProvider for OpenAi {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn predict_request(
        &self,
        messages: &[Message],
        tools: Option<&[Tool]>,
        tool_choice: Option<&ToolChoice>,
        stream: bool,
    ) -> Result<http::Request<Vec<u8>>, EngineError> {
        api::predict_request(self, messages, tools, tool_choice, stream)
    }

    fn parse_predict(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<tandem::Response, EngineError> {
        api::parse_predict(self, response)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn parse_stream_frame(&self, line: &[u8]) -> Result<Vec<ProviderChunk>, EngineError> {
        let mut states = self.tool_state.lock();
        api::parse_sse_line(line, &mut states)
    }

    fn accepted_mime_types(&self) -> &[&str] {
        ACCEPTED_IMAGE_MIME_TYPES
    }

    fn max_image_bytes(&self) -> usize {
        MAX_IMAGE_BYTES
    }
}

impl HttpEmbeddingProvider for OpenAi {
    fn embed_request(
        &self,
        inputs: &[String],
        model: Option<&str>,
    ) -> Result<http::Request<Vec<u8>>, EngineError> {
        api::embed_request(self, inputs, model)
    }

    fn parse_embed(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<(Vec<Vec<f32>>, Usage), EngineError> {
        api::parse_embed(response)
    }

    fn dimensions(&self) -> usize {
        self.embedding_dimensions
            .map(|d| d as usize)
            .unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS)
    }

    fn max_batch_size(&self) -> usize {
        MAX_EMBEDDING_BATCH
    }
}

impl HttpAudioProvider for OpenAi {
    fn stt_request(&self, req: &SttRequest) -> Result<http::Request<Vec<u8>>, EngineError> {
        api::stt_request(self, req)
    }

    fn parse_stt(&self, response: http::Response<Vec<u8>>) -> Result<SttResponse, EngineError> {
        api::parse_stt(response)
    }

    fn tts_request(&self, req: &TtsRequest) -> Result<http::Request<Vec<u8>>, EngineError> {
        api::tts_request(self, req)
    }

    fn parse_tts(&self, response: http::Response<Vec<u8>>) -> Result<TtsResponse, EngineError> {
        api::parse_tts(response)
    }
}

impl CostCalculator for OpenAi {
    fn calculate_cost(
        &self,
        input_tokens: u32,
        output_tokens: u32,
        cached_tokens: u32,
    ) -> CostInfo {
        self.rates
            .unwrap_or_default()
            .cost(input_tokens, output_tokens, cached_tokens)
    }
}
