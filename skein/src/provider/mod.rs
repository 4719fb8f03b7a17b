//! The provider seam: chat requests, responses, and streaming chunks.
//!
//! The HTTP clients themselves live outside this crate; the core only
//! depends on the [`ChatProvider`] trait. A scripted [`MockProvider`] is
//! provided for tests and offline demos.

pub mod mock;

pub use mock::MockProvider;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{Message, ToolCall};
use crate::tool::ToolSpec;
use crate::usage::Usage;

/// A chat completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// JSON schema the response text must conform to, for typed prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Completion token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Create a request for a model with the given messages.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }

    /// Attach tool specs.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// Attach a response schema.
    #[must_use]
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// A completed chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The assistant message, carrying text and/or tool calls.
    pub message: Message,
    /// Token usage, when the provider reported it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// The response text, if any.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        self.message.text()
    }

    /// The tool calls, if any.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.message.tool_calls.as_deref().unwrap_or_default()
    }
}

/// One streaming chunk from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProviderChunk {
    /// Incremental text content.
    Text(String),
    /// The model started declaring a tool call.
    ToolUseStart {
        /// Position of this call in the response.
        index: usize,
        /// Call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// Partial JSON arguments for an in-progress call.
    ToolUseDelta {
        /// Position of the call being extended.
        index: usize,
        /// The raw JSON fragment.
        partial_json: String,
    },
    /// A tool call finished streaming.
    ToolUseEnd {
        /// Position of the completed call.
        index: usize,
    },
    /// Token usage, usually in the final chunk.
    Usage(Usage),
    /// The stream is complete.
    Done,
}

/// A boxed stream of provider chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk>> + Send>>;

/// The LLM provider seam.
///
/// `chat_stream` has a default implementation that replays a completed
/// [`chat`](Self::chat) response as chunks, so non-streaming providers get
/// streaming behavior for free.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name, for logs and configuration errors.
    fn name(&self) -> &str;

    /// Execute a chat completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Execute a chat completion, streaming chunks as they arrive.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let response = self.chat(request).await?;
        Ok(Box::pin(futures::stream::iter(
            chunks_from_response(&response).into_iter().map(Ok),
        )))
    }
}

/// Replay a completed response as the chunk sequence a streaming provider
/// would have produced.
#[must_use]
pub fn chunks_from_response(response: &ChatResponse) -> Vec<ProviderChunk> {
    let mut chunks = Vec::new();
    if let Some(text) = response.text()
        && !text.is_empty()
    {
        chunks.push(ProviderChunk::Text(text));
    }
    for (index, call) in response.tool_calls().iter().enumerate() {
        chunks.push(ProviderChunk::ToolUseStart {
            index,
            id: call.id.clone(),
            name: call.name.clone(),
        });
        if !call.arguments.is_empty() {
            chunks.push(ProviderChunk::ToolUseDelta {
                index,
                partial_json: call.arguments.clone(),
            });
        }
        chunks.push(ProviderChunk::ToolUseEnd { index });
    }
    if let Some(usage) = response.usage {
        chunks.push(ProviderChunk::Usage(usage));
    }
    chunks.push(ProviderChunk::Done);
    chunks
}

/// Reassembles a [`ChatResponse`] from a chunk sequence.
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    text: String,
    calls: HashMap<usize, ToolCall>,
    usage: Option<Usage>,
}

impl ChunkAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the accumulated response.
    pub fn apply(&mut self, chunk: &ProviderChunk) {
        match chunk {
            ProviderChunk::Text(delta) => self.text.push_str(delta),
            ProviderChunk::ToolUseStart { index, id, name } => {
                self.calls
                    .insert(*index, ToolCall::new(id.clone(), name.clone(), String::new()));
            }
            ProviderChunk::ToolUseDelta {
                index,
                partial_json,
            } => {
                if let Some(call) = self.calls.get_mut(index) {
                    call.arguments.push_str(partial_json);
                }
            }
            ProviderChunk::ToolUseEnd { .. } | ProviderChunk::Done => {}
            ProviderChunk::Usage(usage) => self.usage = Some(*usage),
        }
    }

    /// The accumulated arguments of the call at `index`, if it started.
    #[must_use]
    pub fn call_at(&self, index: usize) -> Option<&ToolCall> {
        self.calls.get(&index)
    }

    /// Finish aggregation into a response.
    #[must_use]
    pub fn into_response(self) -> ChatResponse {
        let mut calls: Vec<(usize, ToolCall)> = self.calls.into_iter().collect();
        calls.sort_by_key(|(index, _)| *index);
        let tool_calls: Vec<ToolCall> = calls.into_iter().map(|(_, c)| c).collect();

        let content = (!self.text.is_empty()).then_some(self.text);
        let message = if tool_calls.is_empty() {
            Message::assistant(content.unwrap_or_default())
        } else {
            Message::assistant_tool_calls(content, tool_calls)
        };
        ChatResponse {
            message,
            usage: self.usage,
        }
    }
}

/// Fail fast when a request is structurally unusable.
///
/// Surfaced synchronously at run start, before any events are emitted.
pub fn validate_request(request: &ChatRequest) -> Result<()> {
    if request.model.is_empty() {
        return Err(Error::configuration("no model configured for provider call"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_round_trip_preserves_calls_and_text() {
        let response = ChatResponse {
            message: Message::assistant_tool_calls(
                Some("checking".into()),
                vec![
                    ToolCall::new("t1", "get_weather", r#"{"city":"NYC"}"#),
                    ToolCall::new("t2", "get_time", "{}"),
                ],
            ),
            usage: Some(Usage::new(10, 4)),
        };

        let mut aggregator = ChunkAggregator::new();
        for chunk in chunks_from_response(&response) {
            aggregator.apply(&chunk);
        }
        let rebuilt = aggregator.into_response();

        assert_eq!(rebuilt.text().as_deref(), Some("checking"));
        assert_eq!(rebuilt.tool_calls(), response.tool_calls());
        assert_eq!(rebuilt.usage, response.usage);
    }

    #[test]
    fn aggregator_orders_calls_by_index() {
        let mut aggregator = ChunkAggregator::new();
        aggregator.apply(&ProviderChunk::ToolUseStart {
            index: 1,
            id: "b".into(),
            name: "second".into(),
        });
        aggregator.apply(&ProviderChunk::ToolUseStart {
            index: 0,
            id: "a".into(),
            name: "first".into(),
        });
        let response = aggregator.into_response();
        let names: Vec<&str> = response.tool_calls().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[test]
    fn empty_model_is_a_configuration_error() {
        let request = ChatRequest::new("", Vec::new());
        assert!(matches!(
            validate_request(&request),
            Err(Error::Configuration { .. })
        ));
    }
}
