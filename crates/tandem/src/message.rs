use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::trace::CostInfo;
use crate::ToolCall;

/// Role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// The human participant.
    User,
    /// The model.
    Assistant,
    /// The result of a tool invocation.
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// Media payload identified by MIME type, sourced from exactly one of a
    /// URL, inline bytes, or a file path.
    Media {
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
    },
}

/// The outcome of one tool invocation, attached to a `tool` role message.
/// `call_id` references the earlier [`ToolCall`] this result answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Result of running one validator over a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub validator: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A single conversation element.
///
/// A message is either plain-text (`content` set, `parts` empty) or
/// multimodal (`parts` non-empty; `content` may hold the concatenation of
/// the text parts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
    /// Tool calls this message requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultBlock>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a new builder for a message with the given role.
    pub fn builder(role: Role) -> MessageBuilder {
        MessageBuilder::new(role)
    }

    /// Create a new builder for a user message.
    pub fn user() -> MessageBuilder {
        MessageBuilder::new(Role::User)
    }

    /// Create a new builder for an assistant message.
    pub fn assistant() -> MessageBuilder {
        MessageBuilder::new(Role::Assistant)
    }

    /// Create a new builder for a system message.
    pub fn system() -> MessageBuilder {
        MessageBuilder::new(Role::System)
    }

    /// Create a tool-result message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Message {
        let content = content.into();
        MessageBuilder::new(Role::Tool)
            .content(content.clone())
            .build_with(|m| {
                m.tool_result = Some(ToolResultBlock {
                    call_id: call_id.into(),
                    content,
                    is_error: false,
                });
            })
    }

    /// Whether the message carries media parts.
    pub fn is_multimodal(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::Media { .. }))
    }

    /// The effective text of the message: `content` when set, otherwise the
    /// concatenation of the text parts.
    pub fn text(&self) -> String {
        if let Some(content) = &self.content {
            return content.clone();
        }
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Media { .. } => None,
            })
            .collect()
    }
}

/// Builder for [`Message`].
#[derive(Debug)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            message: Message {
                role,
                content: None,
                parts: Vec::new(),
                tool_calls: Vec::new(),
                tool_result: None,
                timestamp: OffsetDateTime::now_utc(),
                latency: None,
                cost: None,
                validations: Vec::new(),
                metadata: HashMap::new(),
            },
        }
    }

    /// Set the plain-text content.
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.message.content = Some(content.into());
        self
    }

    /// Append a text part.
    pub fn text_part(mut self, text: impl Into<String>) -> Self {
        self.message.parts.push(ContentPart::Text { text: text.into() });
        self
    }

    /// Append a media part referencing a URL.
    pub fn media_url(mut self, mime_type: impl Into<String>, url: impl Into<String>) -> Self {
        self.message.parts.push(ContentPart::Media {
            mime_type: mime_type.into(),
            url: Some(url.into()),
            data: None,
            file_path: None,
        });
        self
    }

    /// Append a media part with inline bytes.
    pub fn media_bytes(mut self, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.message.parts.push(ContentPart::Media {
            mime_type: mime_type.into(),
            url: None,
            data: Some(data),
            file_path: None,
        });
        self
    }

    /// Attach requested tool calls.
    pub fn tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.message.tool_calls = calls;
        self
    }

    /// Attach a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.message.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }

    fn build_with(mut self, f: impl FnOnce(&mut Message)) -> Message {
        f(&mut self.message);
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_message_has_no_parts() {
        let msg = Message::user().content("hello").build();
        assert_eq!(msg.text(), "hello");
        assert!(msg.parts.is_empty());
        assert!(!msg.is_multimodal());
    }

    #[test]
    fn multimodal_text_concatenates_text_parts() {
        let msg = Message::user()
            .text_part("before ")
            .media_url("image/png", "https://example.com/a.png")
            .text_part("after")
            .build();
        assert_eq!(msg.text(), "before after");
        assert!(msg.is_multimodal());
    }

    #[test]
    fn tool_result_references_call_id() {
        let msg = Message::tool_result("call_1", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_result.as_ref().unwrap().call_id, "call_1");
    }
}
