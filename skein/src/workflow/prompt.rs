//! LLM-calling steps: plain and typed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::event::EventPayload;
use crate::message::Message;
use crate::provider::{ChatProvider, ChatRequest};
use crate::retry;
use crate::state::{SharedState, TypedKey};

type MessageBuilder = Box<dyn Fn(&SharedState) -> Vec<Message> + Send + Sync>;

/// Calls the provider with messages built from the state and appends the
/// assistant response to the conversation.
///
/// Transient provider failures are retried per the context's settings;
/// everything in this step's own logic runs exactly once.
pub struct PromptStep {
    name: String,
    provider: Arc<dyn ChatProvider>,
    model: String,
    build: Option<MessageBuilder>,
    response_schema: Option<Value>,
}

impl std::fmt::Debug for PromptStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptStep")
            .field("name", &self.name)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl PromptStep {
    /// Create a prompt step using the state's conversation as the prompt.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            build: None,
            response_schema: None,
        }
    }

    /// Build the prompt messages from the state instead of using the
    /// conversation directly.
    #[must_use]
    pub fn with_builder(
        mut self,
        build: impl Fn(&SharedState) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.build = Some(Box::new(build));
        self
    }

    /// Constrain the response to a JSON schema.
    #[must_use]
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Call the provider, stream the response as message events, append it
    /// to the conversation, and return it.
    async fn execute(&self, ctx: &RunContext, state: &mut SharedState) -> Result<Message> {
        let messages = self
            .build
            .as_ref()
            .map_or_else(|| state.messages().to_vec(), |build| build(state));

        let model = ctx.model().unwrap_or(&self.model);
        let mut request = ChatRequest::new(model, messages);
        if let Some(schema) = &self.response_schema {
            request = request.with_response_schema(schema.clone());
        }

        let response = retry::retry(ctx, ctx.retry(), ctx.forward(), || {
            self.provider.chat(&request)
        })
        .await?;

        let id = format!("msg_{}", Uuid::new_v4().simple());
        let message = response.message.clone().with_id(&id);
        ctx.emit(EventPayload::MessageStart { id: id.clone() });
        if let Some(text) = message.text()
            && !text.is_empty()
        {
            ctx.emit(EventPayload::MessageDelta {
                id: id.clone(),
                delta: text,
            });
        }
        ctx.emit(EventPayload::MessageEnd {
            id,
            response: Some(message.clone()),
            usage: response.usage,
        });

        state.push_message(message.clone());
        Ok(message)
    }
}

#[async_trait]
impl super::Step for PromptStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        self.execute(ctx, state).await.map(|_| ())
    }
}

/// A [`PromptStep`] whose JSON response is parsed into a typed value and
/// stored under a typed key.
///
/// Parse failures yield an unmarshal error and are **not** retried; retry
/// is the provider layer's concern.
pub struct TypedPromptStep<T> {
    inner: PromptStep,
    key: TypedKey<T>,
}

impl<T> std::fmt::Debug for TypedPromptStep<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedPromptStep")
            .field("name", &self.inner.name)
            .field("key", &self.key.name())
            .finish_non_exhaustive()
    }
}

impl<T> TypedPromptStep<T> {
    /// Create a typed prompt step storing the parsed response under `key`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        key: TypedKey<T>,
    ) -> Self {
        Self {
            inner: PromptStep::new(name, provider, model),
            key,
        }
    }

    /// Build the prompt messages from the state.
    #[must_use]
    pub fn with_builder(
        mut self,
        build: impl Fn(&SharedState) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.inner = self.inner.with_builder(build);
        self
    }

    /// Constrain the response to a JSON schema.
    #[must_use]
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.inner = self.inner.with_response_schema(schema);
        self
    }
}

#[async_trait]
impl<T> super::Step for TypedPromptStep<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        let message = self.inner.execute(ctx, state).await?;
        let text = message.text().unwrap_or_default();
        let value: T = serde_json::from_str(text.trim()).map_err(|e| {
            Error::unmarshal(format!("workflow: step \"{}\"", self.inner.name), e.to_string())
        })?;
        state.set(&self.key, value);
        Ok(())
    }
}
