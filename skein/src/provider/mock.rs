//! Scripted provider for tests and offline demos.
//!
//! Responses are returned in sequence, cycling once the script is
//! exhausted, so a script of one tool-call response exercises unbounded
//! loops (e.g. max-step termination) without repetition in the setup.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::{ChatProvider, ChatRequest, ChatResponse};
use crate::error::{Error, Result};
use crate::message::{Message, ToolCall};
use crate::usage::Usage;

#[derive(Debug, Clone)]
enum ScriptItem {
    Respond(Box<ChatResponse>),
    Fail { message: String, status: Option<u16> },
}

/// A provider that replays a scripted sequence of responses and failures.
#[derive(Debug, Default)]
pub struct MockProvider {
    script: Vec<ScriptItem>,
    cursor: AtomicUsize,
}

impl MockProvider {
    /// Create an empty script. At least one item must be added before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plain text response.
    #[must_use]
    pub fn text(mut self, content: impl Into<String>) -> Self {
        self.script.push(ScriptItem::Respond(Box::new(ChatResponse {
            message: Message::assistant(content),
            usage: Some(Usage::new(10, 5)),
        })));
        self
    }

    /// Append a response carrying a single tool call.
    #[must_use]
    pub fn tool_call(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: &Value,
    ) -> Self {
        self.script.push(ScriptItem::Respond(Box::new(ChatResponse {
            message: Message::assistant_tool_calls(
                None,
                vec![ToolCall::new(id, name, arguments.to_string())],
            ),
            usage: Some(Usage::new(10, 5)),
        })));
        self
    }

    /// Append a full response.
    #[must_use]
    pub fn response(mut self, response: ChatResponse) -> Self {
        self.script.push(ScriptItem::Respond(Box::new(response)));
        self
    }

    /// Append a provider failure.
    #[must_use]
    pub fn failure(mut self, message: impl Into<String>, status: Option<u16>) -> Self {
        self.script.push(ScriptItem::Fail {
            message: message.into(),
            status,
        });
        self
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
        if self.script.is_empty() {
            return Err(Error::configuration("mock provider has an empty script"));
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % self.script.len();
        match &self.script[index] {
            ScriptItem::Respond(response) => Ok((**response).clone()),
            ScriptItem::Fail { message, status } => Err(Error::Provider {
                message: message.clone(),
                status: *status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn cycles_through_script() {
        let provider = MockProvider::new().text("first").text("second");
        let request = ChatRequest::new("mock-model", vec![Message::user("hi")]);

        assert_eq!(provider.chat(&request).await.unwrap().text().unwrap(), "first");
        assert_eq!(provider.chat(&request).await.unwrap().text().unwrap(), "second");
        assert_eq!(provider.chat(&request).await.unwrap().text().unwrap(), "first");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn scripted_failures_carry_status() {
        let provider = MockProvider::new()
            .failure("service unavailable", Some(503))
            .text("recovered");
        let request = ChatRequest::new("mock-model", Vec::new());

        let err = provider.chat(&request).await.unwrap_err();
        assert!(matches!(err, Error::Provider { status: Some(503), .. }));
        assert!(provider.chat(&request).await.is_ok());
    }

    #[tokio::test]
    async fn tool_call_scripting() {
        let provider = MockProvider::new().tool_call("t1", "get_weather", &json!({"city": "NYC"}));
        let request = ChatRequest::new("mock-model", Vec::new());
        let response = provider.chat(&request).await.unwrap();
        assert_eq!(response.tool_calls()[0].name, "get_weather");
        assert_eq!(response.tool_calls()[0].arguments, r#"{"city":"NYC"}"#);
    }
}
