//! The agent execution loop.
//!
//! Each iteration calls the provider with the accumulated conversation and
//! registered tool schemas, streams the response as message and tool-call
//! events, then dispatches the requested tools:
//!
//! 1. No tool calls → the run terminates with `reason = stop`.
//! 2. Client-side calls → the run terminates with `reason = client_tools`,
//!    handing the pending calls back to the caller for external execution.
//! 3. Server-side calls → gated through the approval broker when the
//!    policy demands it, then executed concurrently. Results are appended
//!    as a single tool-role message preserving the model's declared order.
//!
//! The loop recovers from handler failures (they become error results the
//! model can react to) and transient provider failures (retry layer);
//! everything else terminates the run with `RunError`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt as _;
use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{Instrument as _, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::broker::ApprovalRequest;
use crate::context::RunContext;
use crate::error::{BrokerError, Error, Result};
use crate::event::{
    ActivityKind, ActivityStatus, DEFAULT_CAPACITY, EventPayload, EventSink, EventStream,
    StopReason, channel,
};
use crate::message::{Message, Role, ToolCall, ToolResult};
use crate::broker::ApprovalBroker;
use crate::provider::{ChatProvider, ChatRequest, ChatResponse, ChunkAggregator, ProviderChunk};
use crate::retry::{self, RetrySettings};
use crate::tool::{ToolHandler, ToolRegistry};
use crate::usage::Usage;

use super::options::AgentOptions;

/// What a completed agent run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Why the run stopped.
    pub reason: StopReason,
    /// The final assistant message, when `reason` is `Stop`.
    pub final_message: Option<Message>,
    /// Calls awaiting external execution, when `reason` is `ClientTools`.
    pub pending_tool_calls: Vec<ToolCall>,
    /// The full transcript, including tool results.
    pub messages: Vec<Message>,
    /// Accumulated token usage.
    pub usage: Usage,
    /// Number of steps taken.
    pub steps: usize,
}

/// A named, tool-calling agent bound to a provider and a tool registry.
#[derive(Clone)]
pub struct Agent {
    name: String,
    model: String,
    instructions: Option<String>,
    provider: Arc<dyn ChatProvider>,
    registry: Arc<ToolRegistry>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create an agent.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            model: String::new(),
            instructions: None,
            provider,
            registry,
        }
    }

    /// Set the model identifier.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the system instructions, prepended when the conversation has no
    /// system message.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// The agent name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tool registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Start a run, returning its event stream.
    ///
    /// The stream's first event is `RunStart` and its last is a terminal
    /// `RunEnd` or `RunError`; the channel closes immediately after.
    ///
    /// # Errors
    ///
    /// Configuration problems (no model resolvable) surface here,
    /// synchronously, before any event is emitted.
    pub fn run_stream(
        &self,
        ctx: RunContext,
        messages: Vec<Message>,
        options: AgentOptions,
    ) -> Result<EventStream> {
        self.resolve_model(&ctx)?;
        let (sink, stream) = channel(DEFAULT_CAPACITY);
        // Handlers see the run's own sink as the forwarding channel, so
        // nested runs merge into this stream.
        let ctx = self.effective_context(ctx, &options).with_forward(sink.clone());
        let agent = self.clone();
        tokio::spawn(async move {
            let _ = agent.run_with_sink(&ctx, &sink, messages, &options).await;
        });
        Ok(stream)
    }

    /// Run to completion, emitting events into the context's forwarding
    /// channel. This is the entry point for nested runs started from tool
    /// handlers: the sub-run's events merge into the parent stream.
    pub async fn run_forwarded(
        &self,
        ctx: &RunContext,
        messages: Vec<Message>,
        options: AgentOptions,
    ) -> Result<RunOutcome> {
        self.resolve_model(ctx)?;
        let child = self.effective_context(ctx.child(), &options);
        match child.forward().cloned() {
            Some(sink) => self.run_with_sink(&child, &sink, messages, &options).await,
            None => {
                // No consumer; events are emitted into a closed channel and
                // dropped, which keeps one code path for both cases.
                let (sink, stream) = channel(1);
                drop(stream);
                let child = child.with_forward(sink.clone());
                self.run_with_sink(&child, &sink, messages, &options).await
            }
        }
    }

    fn resolve_model(&self, ctx: &RunContext) -> Result<String> {
        let model = ctx.model().unwrap_or(&self.model);
        if model.is_empty() {
            return Err(Error::configuration(format!(
                "agent '{}' has no model configured",
                self.name
            )));
        }
        Ok(model.to_owned())
    }

    fn effective_context(&self, ctx: RunContext, options: &AgentOptions) -> RunContext {
        match options.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    async fn run_with_sink(
        &self,
        ctx: &RunContext,
        sink: &EventSink,
        messages: Vec<Message>,
        options: &AgentOptions,
    ) -> Result<RunOutcome> {
        let span = info_span!(
            "agent_run",
            agent = %self.name,
            provider = %self.provider.name(),
        );
        async {
            sink.emit(EventPayload::RunStart);
            match self.drive(ctx, sink, messages, options).await {
                Ok(outcome) => {
                    info!(
                        agent = %self.name,
                        steps = outcome.steps,
                        reason = ?outcome.reason,
                        input_tokens = outcome.usage.input_tokens,
                        output_tokens = outcome.usage.output_tokens,
                        "agent run completed",
                    );
                    sink.emit(EventPayload::RunEnd {
                        reason: outcome.reason,
                        pending_tool_calls: outcome.pending_tool_calls.clone(),
                    });
                    Ok(outcome)
                }
                Err(err) => {
                    error!(agent = %self.name, error = %err, "agent run failed");
                    sink.emit(EventPayload::RunError {
                        error: err.to_string(),
                    });
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// The iteration loop. Terminal `RunEnd` conditions return `Ok`;
    /// failures return `Err` and become `RunError` in the caller.
    async fn drive(
        &self,
        ctx: &RunContext,
        sink: &EventSink,
        mut messages: Vec<Message>,
        options: &AgentOptions,
    ) -> Result<RunOutcome> {
        let model = self.resolve_model(ctx)?;
        let max_steps = ctx.max_steps().unwrap_or(options.max_steps).max(1);
        let retry_settings = options.retry.unwrap_or_else(|| ctx.retry());
        let approver = options.approver.clone().or_else(|| ctx.approver().cloned());
        let approval = if options.approval.is_empty() {
            ctx.approval().clone()
        } else {
            options.approval.clone()
        };

        if let Some(instructions) = &self.instructions
            && !messages.iter().any(|m| m.role == Role::System)
        {
            messages.insert(0, Message::system(instructions));
        }

        let mut usage = Usage::zero();
        let mut step = 0_usize;

        loop {
            step += 1;
            ctx.check_live()?;
            debug!(agent = %self.name, step, "starting step");
            sink.emit(EventPayload::StepStart {
                name: step.to_string(),
            });

            let request =
                ChatRequest::new(model.as_str(), messages.clone()).with_tools(self.registry.list());
            let response = self
                .call_provider(ctx, sink, &request, retry_settings)
                .await?;
            usage += response.usage.unwrap_or_default();

            let tool_calls = response.tool_calls().to_vec();
            if tool_calls.is_empty() {
                let assistant = response.message.clone();
                messages.push(assistant.clone());
                self.finish_step(step, &messages, sink, options);
                return Ok(RunOutcome {
                    reason: StopReason::Stop,
                    final_message: Some(assistant),
                    pending_tool_calls: Vec::new(),
                    messages,
                    usage,
                    steps: step,
                });
            }

            // Partition into client-side hand-off and server-side dispatch.
            let mut client_calls: Vec<ToolCall> = Vec::new();
            let mut server_calls: Vec<(ToolCall, Option<Arc<dyn ToolHandler>>)> = Vec::new();
            for call in &tool_calls {
                match self.registry.resolve(&call.name) {
                    Some((_, Some(handler))) => server_calls.push((call.clone(), Some(handler))),
                    Some((_, None)) => client_calls.push(call.clone()),
                    None => server_calls.push((call.clone(), None)),
                }
            }

            messages.push(response.message.clone());

            if !client_calls.is_empty() {
                self.finish_step(step, &messages, sink, options);
                return Ok(RunOutcome {
                    reason: StopReason::ClientTools,
                    final_message: None,
                    pending_tool_calls: client_calls,
                    messages,
                    usage,
                    steps: step,
                });
            }

            // Approval phase, in declared order.
            let mut results_by_id: HashMap<String, ToolResult> = HashMap::new();
            let mut executable: Vec<(ToolCall, Option<Arc<dyn ToolHandler>>)> = Vec::new();
            for (call, handler) in server_calls {
                if !approval.requires_approval(&call.name) {
                    executable.push((call, handler));
                    continue;
                }
                let Some(approver) = approver.as_ref() else {
                    return Err(Error::configuration(format!(
                        "tool '{}' requires approval but no approval broker is configured",
                        call.name
                    )));
                };
                match self
                    .seek_approval(ctx, sink, approver, &call, options)
                    .await?
                {
                    Some(reason) => {
                        let result = ToolResult::error(&call.id, reason);
                        sink.emit(EventPayload::ToolCallResult {
                            tool_call: call.clone(),
                            tool_result: result.clone(),
                        });
                        results_by_id.insert(call.id.clone(), result);
                    }
                    None => executable.push((call, handler)),
                }
            }

            // Dispatch approved calls concurrently, bounded by the
            // configured concurrency, preserving declared order.
            let concurrency = options
                .max_tool_concurrency
                .unwrap_or(executable.len())
                .max(1);
            for batch in executable.chunks(concurrency) {
                let futs = batch
                    .iter()
                    .map(|(call, handler)| self.execute_one(ctx, sink, call, handler.as_ref()));
                for result in join_all(futs).await {
                    results_by_id.insert(result.tool_call_id.clone(), result);
                }
            }

            // Workers have drained; now honor a cancellation that arrived
            // while they ran.
            ctx.check_live()?;

            let ordered: Vec<ToolResult> = tool_calls
                .iter()
                .filter_map(|call| results_by_id.remove(&call.id))
                .collect();
            messages.push(Message::tool_results(ordered));

            self.finish_step(step, &messages, sink, options);

            if step >= max_steps {
                return Ok(RunOutcome {
                    reason: StopReason::MaxSteps,
                    final_message: None,
                    pending_tool_calls: Vec::new(),
                    messages,
                    usage,
                    steps: step,
                });
            }
        }
    }

    fn finish_step(
        &self,
        step: usize,
        messages: &[Message],
        sink: &EventSink,
        options: &AgentOptions,
    ) {
        if let Some(on_step) = &options.on_step {
            on_step(step, messages);
        }
        sink.emit(EventPayload::StepEnd {
            name: step.to_string(),
        });
    }

    /// Stream one provider call, emitting message and tool-call lifecycle
    /// events, and return the aggregated response.
    async fn call_provider(
        &self,
        ctx: &RunContext,
        sink: &EventSink,
        request: &ChatRequest,
        retry_settings: RetrySettings,
    ) -> Result<ChatResponse> {
        let mut stream = retry::retry(ctx, retry_settings, Some(sink), || {
            self.provider.chat_stream(request)
        })
        .await?;

        let mut aggregator = ChunkAggregator::new();
        let mut open_message: Option<String> = None;

        loop {
            let Some(chunk) = ctx.run_until(stream.next()).await? else {
                break;
            };
            let chunk = chunk?;
            aggregator.apply(&chunk);

            match &chunk {
                ProviderChunk::Text(delta) => {
                    let id = open_message.get_or_insert_with(|| {
                        let id = format!("msg_{}", Uuid::new_v4().simple());
                        sink.emit(EventPayload::MessageStart { id: id.clone() });
                        id
                    });
                    sink.emit(EventPayload::MessageDelta {
                        id: id.clone(),
                        delta: delta.clone(),
                    });
                }
                ProviderChunk::ToolUseStart { id, name, .. } => {
                    sink.emit(EventPayload::ToolCallStart {
                        tool_call: ToolCall::new(id.clone(), name.clone(), String::new()),
                    });
                }
                ProviderChunk::ToolUseDelta { index, .. } => {
                    if let Some(call) = aggregator.call_at(*index) {
                        sink.emit(EventPayload::ToolCallArgs {
                            tool_call: call.clone(),
                        });
                    }
                }
                ProviderChunk::ToolUseEnd { index } => {
                    if let Some(call) = aggregator.call_at(*index) {
                        sink.emit(EventPayload::ToolCallEnd {
                            tool_call: call.clone(),
                        });
                    }
                }
                ProviderChunk::Usage(_) | ProviderChunk::Done => {}
            }
        }

        let mut response = aggregator.into_response();
        if let Some(id) = open_message {
            response.message.id = Some(id.clone());
            sink.emit(EventPayload::MessageEnd {
                id,
                response: Some(response.message.clone()),
                usage: response.usage,
            });
        }
        Ok(response)
    }

    /// Gate one call through the approval broker.
    ///
    /// Returns `Ok(None)` when execution may proceed and `Ok(Some(reason))`
    /// when the call was rejected or its approval timed out. Cancellation
    /// of the waiting context aborts the run.
    async fn seek_approval(
        &self,
        ctx: &RunContext,
        sink: &EventSink,
        approver: &Arc<ApprovalBroker>,
        call: &ToolCall,
        options: &AgentOptions,
    ) -> Result<Option<String>> {
        let args: Value =
            serde_json::from_str(&call.arguments).unwrap_or(Value::String(call.arguments.clone()));
        sink.emit_activity_pending(
            call.id.clone(),
            ActivityKind::ToolApproval,
            json!({
                "toolCallId": call.id,
                "tool": call.name,
                "args": args,
            }),
        );

        let request = ApprovalRequest::new(&call.id, &call.name, args);
        match approver.request(ctx, request, options.approval_timeout).await {
            Ok(decision) if decision.approved => {
                sink.emit(EventPayload::ToolCallApproved {
                    tool_call_id: call.id.clone(),
                });
                sink.emit_activity_status(
                    call.id.clone(),
                    ActivityKind::ToolApproval,
                    ActivityStatus::Approved,
                );
                Ok(None)
            }
            Ok(decision) => {
                let reason = decision.reason.unwrap_or_else(|| "rejected".to_owned());
                sink.emit(EventPayload::ToolCallRejected {
                    tool_call_id: call.id.clone(),
                    reason: reason.clone(),
                });
                sink.emit_activity_status(
                    call.id.clone(),
                    ActivityKind::ToolApproval,
                    ActivityStatus::Rejected,
                );
                Ok(Some(reason))
            }
            Err(BrokerError::Timeout) => {
                warn!(tool = %call.name, "approval request timed out");
                let reason = "approval timed out".to_owned();
                sink.emit(EventPayload::ToolCallRejected {
                    tool_call_id: call.id.clone(),
                    reason: reason.clone(),
                });
                sink.emit_activity_status(
                    call.id.clone(),
                    ActivityKind::ToolApproval,
                    ActivityStatus::Timeout,
                );
                Ok(Some(reason))
            }
            Err(BrokerError::Cancelled) => {
                sink.emit_activity_status(
                    call.id.clone(),
                    ActivityKind::ToolApproval,
                    ActivityStatus::Cancelled,
                );
                Err(Error::Cancelled)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Execute one approved call, producing its result event and record.
    ///
    /// Handler failures and cancellation become error results; they never
    /// escape as run errors from here.
    async fn execute_one(
        &self,
        ctx: &RunContext,
        sink: &EventSink,
        call: &ToolCall,
        handler: Option<&Arc<dyn ToolHandler>>,
    ) -> ToolResult {
        sink.emit(EventPayload::ToolCallExecuting {
            tool_call_id: call.id.clone(),
        });

        let span = info_span!("tool", tool.name = %call.name, tool.id = %call.id);
        let result = async {
            match handler {
                None => {
                    warn!(tool = %call.name, "tool not found");
                    ToolResult::error(&call.id, format!("tool '{}' is not registered", call.name))
                }
                Some(handler) => match ctx.run_until(handler.call(ctx, &call.arguments)).await {
                    Err(err) => ToolResult::error(&call.id, err.to_string()),
                    Ok(Err(err)) => {
                        warn!(tool = %call.name, error = %err, "tool execution failed");
                        ToolResult::error(&call.id, err.to_string())
                    }
                    Ok(Ok(content)) => ToolResult::ok(&call.id, content),
                },
            }
        }
        .instrument(span)
        .await;

        sink.emit(EventPayload::ToolCallResult {
            tool_call: call.clone(),
            tool_result: result.clone(),
        });
        result
    }
}
