//! Wire building and parsing for the OpenAI-compatible dialect.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use either::Either;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use tandem::error::EngineError;
use tandem::message::{ContentPart, Message, Role};
use tandem::provider::{ProviderChunk, Tool, ToolChoice};
use tandem::stt::{SttRequest, SttResponse};
use tandem::tts::{TtsRequest, TtsResponse};
use tandem::{FunctionCall, Response, ToolCall, Usage};

use crate::OpenAi;

/// One message on the wire.
#[derive(Serialize, Debug)]
struct WireMessage<'a> {
    role: &'a str,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "either::serde_untagged_optional"
    )]
    content: Option<Either<Vec<WireContentPart<'a>>, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize, Debug)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    call_type: &'a str,
    function: WireFunctionPayload<'a>,
}

#[derive(Serialize, Debug)]
struct WireFunctionPayload<'a> {
    name: &'a str,
    arguments: &'a str,
}

/// One element of a multimodal `content` array.
#[derive(Serialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Serialize, Debug)]
struct WireImageUrl {
    url: String,
}

/// Request payload for the chat/completions endpoint.
#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Tool]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a ToolChoice>,
    #[serde(flatten)]
    vllm: Option<&'a crate::VllmOptions>,
}

fn endpoint(base_url: &Url, path: &str) -> Result<Url, EngineError> {
    Ok(base_url.join(path)?)
}

fn authorize(
    builder: http::request::Builder,
    api_key: &str,
) -> http::request::Builder {
    if api_key.is_empty() {
        builder
    } else {
        builder.header(AUTHORIZATION, format!("Bearer {api_key}"))
    }
}

fn media_url(mime_type: &str, part: &ContentPart) -> Result<String, EngineError> {
    let ContentPart::Media {
        url, data, file_path, ..
    } = part
    else {
        return Err(EngineError::InvalidRequest(
            "expected a media part".to_string(),
        ));
    };
    if let Some(url) = url {
        return Ok(url.clone());
    }
    if let Some(data) = data {
        let payload = base64::engine::general_purpose::STANDARD.encode(data);
        return Ok(format!("data:{mime_type};base64,{payload}"));
    }
    if file_path.is_some() {
        return Err(EngineError::InvalidRequest(
            "file-backed media must be inlined before sending".to_string(),
        ));
    }
    Err(EngineError::InvalidRequest(
        "media part carries neither url nor data".to_string(),
    ))
}

fn wire_messages<'a>(
    cfg: &'a OpenAi,
    messages: &'a [Message],
) -> Result<Vec<WireMessage<'a>>, EngineError> {
    let mut wire = Vec::with_capacity(messages.len() + 1);

    let has_system = messages.first().is_some_and(|m| m.role == Role::System);
    if let Some(system) = cfg.system.as_deref() {
        if !has_system {
            wire.push(WireMessage {
                role: Role::System.as_str(),
                content: Some(Either::Right(system.to_string())),
                tool_calls: None,
                tool_call_id: None,
            });
        }
    }

    for message in messages {
        let content = if message.parts.is_empty() {
            message.content.clone().map(Either::Right)
        } else {
            let mut parts = Vec::with_capacity(message.parts.len());
            for part in &message.parts {
                match part {
                    ContentPart::Text { text } => {
                        parts.push(WireContentPart::Text { text });
                    }
                    ContentPart::Media { mime_type, .. } => {
                        parts.push(WireContentPart::ImageUrl {
                            image_url: WireImageUrl {
                                url: media_url(mime_type, part)?,
                            },
                        });
                    }
                }
            }
            Some(Either::Left(parts))
        };

        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: &call.id,
                        call_type: &call.call_type,
                        function: WireFunctionPayload {
                            name: &call.function.name,
                            arguments: &call.function.arguments,
                        },
                    })
                    .collect(),
            )
        };

        wire.push(WireMessage {
            role: message.role.as_str(),
            content,
            tool_calls,
            tool_call_id: message.tool_result.as_ref().map(|r| r.call_id.as_str()),
        });
    }

    Ok(wire)
}

pub fn predict_request(
    cfg: &OpenAi,
    messages: &[Message],
    tools: Option<&[Tool]>,
    tool_choice: Option<&ToolChoice>,
    stream: bool,
) -> Result<http::Request<Vec<u8>>, EngineError> {
    let tools = tools.or(cfg.tools.as_deref());
    let tool_choice = tool_choice.or(cfg.tool_choice.as_ref());

    let body = ChatRequest {
        model: &cfg.model,
        messages: wire_messages(cfg, messages)?,
        max_tokens: cfg.max_tokens,
        temperature: cfg.temperature,
        top_p: cfg.top_p,
        seed: cfg.seed,
        stream,
        tools,
        tool_choice: if tools.is_some() { tool_choice } else { None },
        vllm: cfg.vllm.as_ref(),
    };

    let url = endpoint(&cfg.base_url, "chat/completions")?;
    let mut builder = http::Request::builder()
        .method(Method::POST)
        .uri(url.as_str())
        .header(CONTENT_TYPE, "application/json");
    if stream {
        builder = builder.header(ACCEPT, "text/event-stream");
    }
    builder = authorize(builder, &cfg.api_key);

    Ok(builder.body(serde_json::to_vec(&body)?)?)
}

/// Raw usage block, normalised into [`Usage`].
#[derive(Deserialize, Debug, Clone)]
struct RawUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

impl RawUsage {
    fn into_usage(self) -> Usage {
        let cached = self
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .unwrap_or(0);
        Usage {
            input_tokens: self.prompt_tokens.saturating_sub(cached),
            output_tokens: self.completion_tokens,
            cached_tokens: cached,
        }
    }
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChoiceMessage,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    #[allow(dead_code)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize, Debug)]
struct ErrorDetail {
    message: String,
}

/// Surface a non-OK response, preferring the JSON `error.message` body.
fn status_error(status: u16, body: &[u8]) -> EngineError {
    let body = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    };
    EngineError::HttpStatus { status, body }
}

pub fn parse_predict(
    cfg: &OpenAi,
    response: http::Response<Vec<u8>>,
) -> Result<Response, EngineError> {
    let status = response.status().as_u16();
    let body = response.into_body();
    if !(200..300).contains(&status) {
        return Err(status_error(status, &body));
    }

    // An OK response can still carry an error payload.
    if let Ok(err) = serde_json::from_slice::<ErrorBody>(&body) {
        return Err(EngineError::Api(err.error.message));
    }

    let parsed: ChatResponse = serde_json::from_slice(&body)?;
    let usage = parsed.usage.map(RawUsage::into_usage).unwrap_or_default();

    // Empty `choices` arrays are tolerated; the response is simply empty.
    let (content, tool_calls) = match parsed.choices.into_iter().next() {
        Some(choice) => (
            choice.message.content.unwrap_or_default(),
            choice.message.tool_calls.unwrap_or_default(),
        ),
        None => (String::new(), Vec::new()),
    };

    let cost = cfg
        .rates
        .map(|rates| {
            rates
                .cost(usage.input_tokens, usage.output_tokens, usage.cached_tokens)
                .total_cost
        })
        .unwrap_or(0.0);

    Ok(Response {
        role: Role::Assistant,
        content,
        tool_calls,
        final_response: None,
        provider: "openai".to_string(),
        model: cfg.model.clone(),
        latency: Duration::ZERO,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cost,
    })
}

#[derive(Serialize, Debug)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding_format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub fn embed_request(
    cfg: &OpenAi,
    inputs: &[String],
    model: Option<&str>,
) -> Result<http::Request<Vec<u8>>, EngineError> {
    let body = EmbeddingRequest {
        model: model.unwrap_or(&cfg.model),
        input: inputs,
        encoding_format: cfg.embedding_encoding_format.as_deref(),
        dimensions: cfg.embedding_dimensions,
    };

    let url = endpoint(&cfg.base_url, "embeddings")?;
    let builder = authorize(
        http::Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/json"),
        &cfg.api_key,
    );
    Ok(builder.body(serde_json::to_vec(&body)?)?)
}

pub fn parse_embed(
    response: http::Response<Vec<u8>>,
) -> Result<(Vec<Vec<f32>>, Usage), EngineError> {
    let status = response.status().as_u16();
    let body = response.into_body();
    if !(200..300).contains(&status) {
        return Err(status_error(status, &body));
    }
    let parsed: EmbeddingResponse = serde_json::from_slice(&body)?;
    let usage = parsed.usage.map(RawUsage::into_usage).unwrap_or_default();
    Ok((
        parsed.data.into_iter().map(|d| d.embedding).collect(),
        usage,
    ))
}

#[derive(Deserialize, Debug)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize, Debug)]
struct ModelEntry {
    id: String,
}

pub fn list_models_request(cfg: &OpenAi) -> Result<http::Request<Vec<u8>>, EngineError> {
    let url = endpoint(&cfg.base_url, "models")?;
    let builder = authorize(
        http::Request::builder().method(Method::GET).uri(url.as_str()),
        &cfg.api_key,
    );
    Ok(builder.body(Vec::new())?)
}

pub fn parse_list_models(response: http::Response<Vec<u8>>) -> Result<Vec<String>, EngineError> {
    let status = response.status().as_u16();
    let body = response.into_body();
    if !(200..300).contains(&status) {
        return Err(status_error(status, &body));
    }
    let parsed: ModelList = serde_json::from_slice(&body)?;
    Ok(parsed.data.into_iter().map(|m| m.id).collect())
}

const MULTIPART_BOUNDARY: &str = "tandem-form-boundary";

/// A value is only safe inside a multipart header or text part if it cannot
/// terminate the part early.
fn part_safe(field: &'static str, value: &str) -> Result<(), EngineError> {
    if value.contains('\r') || value.contains('\n') {
        return Err(EngineError::InvalidRequest(format!(
            "{field} must not contain line breaks"
        )));
    }
    Ok(())
}

/// Assemble the transcription request body as multipart/form-data: the
/// Whisper-style text fields first, then the audio payload as the `file`
/// part.
fn transcription_form(req: &SttRequest) -> Result<Vec<u8>, EngineError> {
    let model = req.model.as_deref().unwrap_or("whisper-1");
    let filename = req.filename.as_deref().unwrap_or("audio.wav");
    let mime_type = req.mime_type.as_deref().unwrap_or("audio/wav");

    part_safe("model", model)?;
    part_safe("filename", filename)?;
    part_safe("mime_type", mime_type)?;
    if filename.contains('"') {
        return Err(EngineError::InvalidRequest(
            "filename must not contain quotes".to_string(),
        ));
    }

    let mut text_fields = vec![("model", model), ("response_format", "json")];
    if let Some(language) = req.language.as_deref() {
        part_safe("language", language)?;
        text_fields.push(("language", language));
    }

    let mut body = Vec::with_capacity(req.audio.len() + 512);
    for (name, value) in text_fields {
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"{name}\"\r\n\r\n\
                 {value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: {mime_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&req.audio);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}

pub fn stt_request(cfg: &OpenAi, req: &SttRequest) -> Result<http::Request<Vec<u8>>, EngineError> {
    if req.audio.is_empty() {
        return Err(EngineError::InvalidRequest(
            "transcription request audio is empty".to_string(),
        ));
    }

    let body = transcription_form(req)?;
    let url = endpoint(&cfg.base_url, "audio/transcriptions")?;
    let builder = authorize(
        http::Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
            ),
        &cfg.api_key,
    );
    Ok(builder.body(body)?)
}

#[derive(Deserialize, Debug)]
struct SttJsonResponse {
    text: String,
}

pub fn parse_stt(response: http::Response<Vec<u8>>) -> Result<SttResponse, EngineError> {
    let status = response.status().as_u16();
    let body = response.into_body();
    if !(200..300).contains(&status) {
        return Err(status_error(status, &body));
    }
    let parsed: SttJsonResponse = serde_json::from_slice(&body)?;
    Ok(SttResponse { text: parsed.text })
}

#[derive(Serialize, Debug)]
struct TtsRequestBody<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    #[serde(rename = "response_format", skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
}

pub fn tts_request(cfg: &OpenAi, req: &TtsRequest) -> Result<http::Request<Vec<u8>>, EngineError> {
    if req.text.trim().is_empty() {
        return Err(EngineError::InvalidRequest(
            "synthesis request text is empty".to_string(),
        ));
    }

    let body = TtsRequestBody {
        model: req.model.as_deref().unwrap_or("tts-1"),
        text: &req.text,
        voice: req.voice.as_deref(),
        format: req.format.as_deref(),
        speed: req.speed,
    };

    let url = endpoint(&cfg.base_url, "audio/speech")?;
    let builder = authorize(
        http::Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/json"),
        &cfg.api_key,
    );
    Ok(builder.body(serde_json::to_vec(&body)?)?)
}

pub fn parse_tts(response: http::Response<Vec<u8>>) -> Result<TtsResponse, EngineError> {
    let status = response.status().as_u16();
    let mime_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.into_body();
    if !(200..300).contains(&status) {
        return Err(status_error(status, &body));
    }
    Ok(TtsResponse {
        audio: body,
        mime_type,
    })
}

/// Streaming frame shapes.
#[derive(Deserialize, Debug)]
struct StreamFrame {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: StreamFunction,
}

#[derive(Deserialize, Debug, Default)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    /// Always present but possibly empty.
    #[serde(default)]
    arguments: String,
}

/// Incremental tool-call assembly state, keyed by delta index.
#[derive(Debug, Default)]
pub struct ToolDeltaState {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub started: bool,
}

fn drain_tool_completions(
    states: &mut HashMap<usize, ToolDeltaState>,
    out: &mut Vec<ProviderChunk>,
) {
    let mut entries: Vec<_> = states.drain().collect();
    entries.sort_by_key(|(index, _)| *index);
    for (index, state) in entries {
        if state.started {
            out.push(ProviderChunk::ToolCallComplete {
                index,
                tool_call: ToolCall {
                    id: state.id,
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: state.name,
                        arguments: state.arguments,
                    },
                },
            });
        }
    }
}

/// Parse one SSE line into chunks.
///
/// Non-`data:` lines are ignored, `[DONE]` flushes pending tool calls and
/// terminates, and an unparsable frame returns
/// [`EngineError::StreamParse`] so the scanner can log and skip it.
pub fn parse_sse_line(
    line: &[u8],
    states: &mut HashMap<usize, ToolDeltaState>,
) -> Result<Vec<ProviderChunk>, EngineError> {
    let text = String::from_utf8_lossy(line);
    let line = text.trim();
    let Some(data) = line.strip_prefix("data: ").or(line.strip_prefix("data:")) else {
        return Ok(Vec::new());
    };
    let data = data.trim();

    let mut out = Vec::new();

    if data == "[DONE]" {
        drain_tool_completions(states, &mut out);
        out.push(ProviderChunk::Done {
            finish_reason: "stop".to_string(),
        });
        return Ok(out);
    }

    let frame: StreamFrame = serde_json::from_str(data)
        .map_err(|e| EngineError::StreamParse(format!("{e}: {data}")))?;

    for choice in &frame.choices {
        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                out.push(ProviderChunk::Text(content.clone()));
            }
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for call in tool_calls {
                let index = call.index.unwrap_or(0);
                let state = states.entry(index).or_default();

                if let Some(id) = &call.id {
                    state.id = id.clone();
                }
                if let Some(name) = &call.function.name {
                    state.name = name.clone();
                    if !state.started {
                        state.started = true;
                        out.push(ProviderChunk::ToolCallStart {
                            index,
                            id: state.id.clone(),
                            name: state.name.clone(),
                        });
                    }
                }
                if !call.function.arguments.is_empty() {
                    state.arguments.push_str(&call.function.arguments);
                    out.push(ProviderChunk::ToolCallDelta {
                        index,
                        arguments: call.function.arguments.clone(),
                    });
                }
            }
        }

        if let Some(finish_reason) = &choice.finish_reason {
            drain_tool_completions(states, &mut out);
            out.push(ProviderChunk::Done {
                finish_reason: finish_reason.clone(),
            });
        }
    }

    if let Some(usage) = frame.usage {
        out.push(ProviderChunk::Usage(usage.into_usage()));
    }

    Ok(out)
}
