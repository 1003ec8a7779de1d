//! The adapter contract the pipeline drives.
//!
//! An adapter declares which capabilities it implements by implementing the
//! corresponding traits; everything beyond [`PredictProvider`] has a
//! default-deny or is opt-in. Streaming output travels over bounded
//! [`tokio::sync::mpsc`] channels; every blocking operation takes the
//! caller's cancellation token.

use std::fmt;

use async_trait::async_trait;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::Response;
use crate::error::EngineError;
use crate::message::Message;
use crate::trace::CostInfo;
use crate::{ToolCall, Usage};

pub mod http;
pub mod loopback;

/// A tool made available to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// The type of tool (e.g. "function").
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function definition if this is a function tool.
    pub function: FunctionTool,
}

/// A function definition for a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionTool {
    pub name: String,
    pub description: String,
    /// JSON schema of the parameters, carried verbatim.
    pub parameters: Value,
}

/// How the model may use the available tools. The wire forms are the
/// OpenAI-compatible ones; adapters for other dialects translate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    /// Model may use any tool and may elect to use none.
    #[default]
    Auto,
    /// Model must use at least one tool.
    Required,
    /// Tools are disabled for this call.
    None,
    /// Model must call the named function. Serialized as the vendor's
    /// function-object form.
    Function(String),
}

impl Serialize for ToolChoice {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            ToolChoice::Auto => serializer.serialize_str("auto"),
            ToolChoice::Required => serializer.serialize_str("required"),
            ToolChoice::None => serializer.serialize_str("none"),
            ToolChoice::Function(name) => {
                use serde::ser::SerializeMap;

                // {"type": "function", "function": {"name": ...}}
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "function")?;

                let mut function_obj = std::collections::HashMap::new();
                function_obj.insert("name", name.as_str());
                map.serialize_entry("function", &function_obj)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ToolChoice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ToolChoiceVisitor;

        impl<'de> Visitor<'de> for ToolChoiceVisitor {
            type Value = ToolChoice;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a string (`auto`, `required`, `none`) or an object \
                     `{ type: \"function\", function: { name: ... } }`",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match value {
                    "auto" => Ok(ToolChoice::Auto),
                    "required" => Ok(ToolChoice::Required),
                    "none" => Ok(ToolChoice::None),
                    other => Err(de::Error::unknown_variant(
                        other,
                        &["auto", "required", "none"],
                    )),
                }
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut seen_name: Option<String> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => {
                            let t: String = map.next_value()?;
                            if t != "function" {
                                return Err(de::Error::invalid_value(
                                    de::Unexpected::Str(&t),
                                    &"function",
                                ));
                            }
                        }
                        "function" => {
                            let func_map: serde_json::Map<String, Value> = map.next_value()?;
                            if let Some(Value::String(name)) = func_map.get("name") {
                                seen_name = Some(name.clone());
                            } else {
                                return Err(de::Error::missing_field("name"));
                            }
                        }
                        _ => {
                            let _ignored: Value = map.next_value()?;
                        }
                    }
                }
                let name = seen_name.ok_or_else(|| de::Error::missing_field("function"))?;
                Ok(ToolChoice::Function(name))
            }
        }

        deserializer.deserialize_any(ToolChoiceVisitor)
    }
}

/// One frame of a provider's streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderChunk {
    /// Text content delta.
    Text(String),

    /// A tool call started streaming (first frame carries id and name).
    ToolCallStart { index: usize, id: String, name: String },

    /// Partial JSON for a tool call's arguments. Argument strings are
    /// concatenated in arrival order, keyed by `index`.
    ToolCallDelta { index: usize, arguments: String },

    /// A tool call finished assembling.
    ToolCallComplete { index: usize, tool_call: ToolCall },

    /// Token usage metadata, typically in the final frame.
    Usage(Usage),

    /// The stream ended with the given vendor finish reason.
    Done { finish_reason: String },

    /// The caller cancelled; the scanner stops after emitting this.
    Cancelled,
}

/// Receiving half of a provider stream.
pub type ProviderStream = mpsc::Receiver<Result<ProviderChunk, EngineError>>;

/// Request-response prediction. The minimum capability every adapter
/// implements.
#[async_trait]
pub trait PredictProvider: Send + Sync {
    /// Stable adapter name, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// The model this adapter instance is configured for.
    fn model(&self) -> &str;

    async fn predict(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<Response, EngineError>;

    /// Whether [`PredictProvider::predict_stream`] is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Streaming prediction. The returned channel is closed when the stream
    /// ends; a cancelled call yields a [`ProviderChunk::Cancelled`] before
    /// close.
    async fn predict_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<ProviderStream, EngineError> {
        let _ = (cancel, messages);
        Err(EngineError::NotImplemented(
            "streaming prediction".to_string(),
        ))
    }
}

/// Tool-call support.
#[async_trait]
pub trait ToolProvider: PredictProvider {
    /// Translate tool descriptors into the adapter's wire form. The result
    /// is opaque to the engine and handed back on every tool call.
    fn build_tooling(&self, tools: &[Tool]) -> Result<Value, EngineError>;

    async fn predict_with_tools(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tooling: &Value,
        choice: &ToolChoice,
    ) -> Result<(Response, Vec<ToolCall>), EngineError>;

    async fn predict_stream_with_tools(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
        tooling: &Value,
        choice: &ToolChoice,
    ) -> Result<ProviderStream, EngineError> {
        let _ = (cancel, messages, tooling, choice);
        Err(EngineError::NotImplemented(
            "streaming tool prediction".to_string(),
        ))
    }
}

/// Multimodal (image-bearing) prediction.
#[async_trait]
pub trait MultimodalProvider: PredictProvider {
    /// MIME types the adapter accepts in media parts.
    fn accepted_mime_types(&self) -> &[&str];

    /// Per-image payload cap in bytes.
    fn max_image_bytes(&self) -> usize;

    async fn predict_multimodal(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<Response, EngineError>;

    async fn predict_multimodal_stream(
        &self,
        cancel: &CancellationToken,
        messages: &[Message],
    ) -> Result<ProviderStream, EngineError> {
        let _ = (cancel, messages);
        Err(EngineError::NotImplemented(
            "streaming multimodal prediction".to_string(),
        ))
    }
}

/// Vector embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(
        &self,
        cancel: &CancellationToken,
        inputs: &[String],
        model: Option<&str>,
    ) -> Result<(Vec<Vec<f32>>, Usage), EngineError>;

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;

    /// Maximum number of inputs per call.
    fn max_batch_size(&self) -> usize;
}

/// USD cost for a token count triple.
pub trait CostCalculator: Send + Sync {
    fn calculate_cost(&self, input_tokens: u32, output_tokens: u32, cached_tokens: u32)
        -> CostInfo;
}

/// A chunk of media submitted to a streaming-input session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChunk {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl MediaChunk {
    /// Raw 16-bit little-endian PCM at the given sample rate.
    pub fn pcm16(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            data,
            mime_type: format!("audio/pcm;rate={sample_rate}"),
        }
    }
}

/// A provider's long-lived connection accepting interleaved media and text
/// submissions and emitting response chunks until explicitly closed.
#[async_trait]
pub trait StreamingInputSession: Send + Sync {
    async fn send_chunk(
        &self,
        cancel: &CancellationToken,
        chunk: &MediaChunk,
    ) -> Result<(), EngineError>;

    async fn send_text(&self, cancel: &CancellationToken, text: &str) -> Result<(), EngineError>;

    /// Take the response channel. Yields `Some` on the first call only.
    fn response(&self) -> Option<ProviderStream>;

    /// Resolves when the session has finished emitting.
    async fn done(&self);

    /// The terminal error, if the session failed.
    fn error(&self) -> Option<EngineError>;

    /// Idempotent close.
    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
impl<T: StreamingInputSession + ?Sized> StreamingInputSession for std::sync::Arc<T> {
    async fn send_chunk(
        &self,
        cancel: &CancellationToken,
        chunk: &MediaChunk,
    ) -> Result<(), EngineError> {
        (**self).send_chunk(cancel, chunk).await
    }

    async fn send_text(&self, cancel: &CancellationToken, text: &str) -> Result<(), EngineError> {
        (**self).send_text(cancel, text).await
    }

    fn response(&self) -> Option<ProviderStream> {
        (**self).response()
    }

    async fn done(&self) {
        (**self).done().await;
    }

    fn error(&self) -> Option<EngineError> {
        (**self).error()
    }

    async fn close(&self) -> Result<(), EngineError> {
        (**self).close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_string_forms_round_trip() {
        for (choice, wire) in [
            (ToolChoice::Auto, "\"auto\""),
            (ToolChoice::Required, "\"required\""),
            (ToolChoice::None, "\"none\""),
        ] {
            assert_eq!(serde_json::to_string(&choice).unwrap(), wire);
            assert_eq!(serde_json::from_str::<ToolChoice>(wire).unwrap(), choice);
        }
    }

    #[test]
    fn tool_choice_function_uses_vendor_object_form() {
        let json = serde_json::to_value(ToolChoice::Function("lookup".into())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "function", "function": {"name": "lookup"}})
        );

        let parsed: ToolChoice = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, ToolChoice::Function("lookup".into()));
    }
}
