//! Message types for agent-model communication.
//!
//! Messages follow chat completion conventions: a role, either plain text
//! content or a list of multimodal parts (never both), and — for assistant
//! and tool-role messages — the tool calls and tool results exchanged
//! during a run.

use serde::{Deserialize, Serialize};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool-result message.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One part of a multimodal message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image referenced by URL.
    ImageUrl {
        /// The image URL.
        url: String,
    },
    /// Inline image bytes.
    ImageBytes {
        /// Base64-encoded image data.
        data: String,
        /// MIME type of the image, e.g. `image/png`.
        mime_type: String,
    },
}

impl ContentPart {
    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image-URL part.
    #[must_use]
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl { url: url.into() }
    }

    /// Create an inline-image part.
    #[must_use]
    pub fn image_bytes(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::ImageBytes {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// A tool call requested by the model.
///
/// `arguments` is the raw JSON string exactly as the model produced it;
/// handlers own the decode so malformed arguments become tool-level errors
/// the model can self-correct from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call within the run.
    pub id: String,
    /// Name of the tool being called.
    pub name: String,
    /// Raw JSON arguments string.
    pub arguments: String,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the raw arguments into a typed value.
    pub fn parse_arguments<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.arguments)
    }
}

/// The result of executing (or rejecting) a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The id of the tool call this result answers.
    pub tool_call_id: String,
    /// Result content handed back to the model.
    pub content: String,
    /// Whether the content describes a failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// A successful result.
    #[must_use]
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// A chat message in a conversation.
///
/// Plain `content` and multimodal `parts` are mutually exclusive; the
/// constructors enforce this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Optional message id, assigned when the message is streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Role of the message sender.
    pub role: Role,
    /// Plain text content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Multimodal content parts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<ContentPart>>,
    /// Tool calls requested by the model (assistant messages).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Tool results (tool-role messages).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
}

impl Message {
    fn text_message(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: Some(content.into()),
            parts: None,
            tool_calls: None,
            tool_results: None,
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::text_message(Role::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::text_message(Role::User, content)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, content)
    }

    /// Create a multimodal user message.
    #[must_use]
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            id: None,
            role: Role::User,
            content: None,
            parts: Some(parts),
            tool_calls: None,
            tool_results: None,
        }
    }

    /// Create an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            content,
            parts: None,
            tool_calls: Some(tool_calls),
            tool_results: None,
        }
    }

    /// Create a tool-role message carrying results for one step, in the
    /// order the model declared the calls.
    #[must_use]
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            id: None,
            role: Role::Tool,
            content: None,
            parts: None,
            tool_calls: None,
            tool_results: Some(results),
        }
    }

    /// Attach an id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The plain text of the message, joining text parts when multimodal.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        if let Some(content) = &self.content {
            return Some(content.clone());
        }
        self.parts.as_ref().map(|parts| {
            parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    /// Whether this message carries at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_parts_are_exclusive() {
        let plain = Message::user("hi");
        assert!(plain.content.is_some() && plain.parts.is_none());

        let multi = Message::user_parts(vec![
            ContentPart::text("look:"),
            ContentPart::image_url("https://example.com/a.png"),
        ]);
        assert!(multi.content.is_none() && multi.parts.is_some());
        assert_eq!(multi.text().as_deref(), Some("look:"));
    }

    #[test]
    fn tool_call_argument_parsing() {
        #[derive(Deserialize)]
        struct Args {
            city: String,
        }
        let call = ToolCall::new("t1", "get_weather", r#"{"city":"NYC"}"#);
        let args: Args = call.parse_arguments().unwrap();
        assert_eq!(args.city, "NYC");

        let bad = ToolCall::new("t2", "get_weather", "{not json");
        assert!(bad.parse_arguments::<Args>().is_err());
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }
}
