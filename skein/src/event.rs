//! The unified event protocol shared by the agent loop and workflow engine.
//!
//! Every run — agent or workflow, top-level or nested — produces one ordered
//! stream of [`Event`]s. Emission is non-blocking: the channel is buffered
//! (default 100) and a full buffer drops the event rather than stall the
//! producer. Consumers that need loss-free delivery must read promptly or
//! wrap the stream with a back-pressuring adapter.
//!
//! Stream shape contract:
//! - `RunStart` is the first event on a channel.
//! - The last event before close is a terminal `RunEnd` or `RunError`.
//! - Nested runs forward their events into the parent sink; lifecycle
//!   duplicates are elided downstream by a depth-counting mapper.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::message::{Message, ToolCall, ToolResult};
use crate::patch::Patch;
use crate::usage::Usage;

/// Default event channel capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Why a run reached its terminal `RunEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced a final answer.
    Stop,
    /// The model called client-side tools; control returns to the caller.
    ClientTools,
    /// The step budget was exhausted.
    MaxSteps,
}

/// The kind of transient UI activity a snapshot/delta pair describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A pending tool-approval request.
    ToolApproval,
    /// A pending user-input request.
    UserInput,
    /// A long-running operation indicator.
    Loading,
}

/// Terminal status written to an activity's `/status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Waiting on an external decision.
    Pending,
    /// The tool call was approved.
    Approved,
    /// The tool call was rejected.
    Rejected,
    /// The user responded.
    Responded,
    /// The owning run was cancelled.
    Cancelled,
    /// The request timed out.
    Timeout,
}

impl ActivityStatus {
    /// The wire string written into activity documents.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Responded => "responded",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

/// Discriminated event payload. See the module docs for ordering rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
#[non_exhaustive]
pub enum EventPayload {
    // Run lifecycle.
    /// A run opened.
    RunStart,
    /// A run finished cleanly.
    RunEnd {
        /// Why the run stopped.
        reason: StopReason,
        /// Tool calls awaiting external execution when `reason` is
        /// `ClientTools`; empty otherwise.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pending_tool_calls: Vec<ToolCall>,
    },
    /// A run failed.
    RunError {
        /// Human-readable failure reason.
        error: String,
    },

    // Step lifecycle.
    /// A step (agent iteration or workflow node) started.
    StepStart {
        /// Step name; agent iterations use the iteration number.
        name: String,
    },
    /// A step finished.
    StepEnd {
        /// Step name.
        name: String,
    },
    /// A step was skipped (e.g. a non-selected route).
    StepSkipped {
        /// Step name.
        name: String,
    },

    // Message lifecycle.
    /// A streamed assistant message opened.
    MessageStart {
        /// Message id shared by the delta and end events.
        id: String,
    },
    /// Incremental message content.
    MessageDelta {
        /// Message id.
        id: String,
        /// The text fragment.
        delta: String,
    },
    /// A streamed message completed.
    MessageEnd {
        /// Message id.
        id: String,
        /// The assembled message, when available.
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Message>,
        /// Token usage for the provider call that produced the message.
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    // Tool-call lifecycle.
    /// The model began declaring a tool call.
    ToolCallStart {
        /// The call as known so far (arguments may be partial).
        tool_call: ToolCall,
    },
    /// The model streamed more arguments for a call.
    ToolCallArgs {
        /// The call with arguments accumulated so far.
        tool_call: ToolCall,
    },
    /// The model finished declaring a tool call.
    ToolCallEnd {
        /// The complete call.
        tool_call: ToolCall,
    },
    /// A tool call produced a result.
    ToolCallResult {
        /// The call the result answers.
        tool_call: ToolCall,
        /// The result.
        tool_result: ToolResult,
    },

    // Tool approval.
    /// A gated tool call was approved.
    ToolCallApproved {
        /// The approved call id.
        tool_call_id: String,
    },
    /// A gated tool call was rejected.
    ToolCallRejected {
        /// The rejected call id.
        tool_call_id: String,
        /// The decider's reason.
        reason: String,
    },
    /// A tool call entered execution.
    ToolCallExecuting {
        /// The executing call id.
        tool_call_id: String,
    },

    // Workflow combinators.
    /// A parallel combinator began fanning out.
    ParallelStart {
        /// Combinator name.
        name: String,
    },
    /// A parallel combinator joined all branches.
    ParallelEnd {
        /// Combinator name.
        name: String,
    },
    /// A router selected a route.
    RouteSelected {
        /// Router name.
        name: String,
        /// The selected route.
        route_name: String,
    },
    /// A loop entered an iteration.
    LoopIteration {
        /// Loop name.
        name: String,
        /// 1-based iteration counter.
        iteration: usize,
    },

    // State sync.
    /// Full shared-state snapshot.
    StateSnapshot {
        /// The state as a JSON object.
        state: Value,
    },
    /// Incremental state update; applicable against the latest snapshot.
    StateDelta {
        /// RFC-6902 records.
        patches: Vec<Patch>,
    },
    /// Full conversation snapshot.
    MessagesSnapshot {
        /// The message list.
        messages: Vec<Message>,
    },

    // Activities.
    /// A transient UI request opened.
    ActivitySnapshot {
        /// Activity id.
        id: String,
        /// What kind of request this is.
        kind: ActivityKind,
        /// The activity document (must contain a `status` field).
        content: Value,
    },
    /// A transient UI request changed, usually its `/status` field.
    ActivityDelta {
        /// Activity id.
        id: String,
        /// What kind of request this is.
        kind: ActivityKind,
        /// RFC-6902 records against the activity document.
        patches: Vec<Patch>,
    },

    // Retry.
    /// A provider call attempt began.
    RetryAttempt {
        /// 1-based attempt counter.
        attempt: u32,
    },
    /// A retry was scheduled after a transient failure.
    RetryScheduled {
        /// Backoff delay in milliseconds.
        delay_ms: u64,
    },
    /// An attempt failed with a retryable error.
    RetryFailed {
        /// The transient error.
        error: String,
    },
    /// A retried call eventually succeeded.
    RetrySuccess,
    /// All attempts were exhausted.
    RetryExhausted {
        /// The final error.
        error: String,
    },
}

/// A timestamped event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Milliseconds since the unix epoch, non-decreasing per process.
    pub timestamp: u64,
    /// The discriminated payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with the current time.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: now_ms(),
            payload,
        }
    }
}

/// Wall-clock milliseconds, clamped so consecutive reads never go backwards.
pub(crate) fn now_ms() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    LAST.fetch_max(now, Ordering::AcqRel).max(now)
}

/// Create a buffered event channel.
///
/// The sink side is cheaply cloneable; the channel closes once every sink
/// clone has been dropped, which the run owner does immediately after the
/// terminal event.
#[must_use]
pub fn channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSink { tx }, EventStream { rx })
}

/// The writing half of an event channel.
///
/// All emission is non-blocking; a full buffer drops the event by design so
/// a slow consumer can never deadlock the run.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Emit an event, dropping it silently if the buffer is full or the
    /// consumer has gone away.
    pub fn emit(&self, payload: EventPayload) {
        if let Err(err) = self.tx.try_send(Event::new(payload)) {
            tracing::trace!(error = %err, "event dropped");
        }
    }

    /// Emit a full state snapshot.
    pub fn emit_snapshot(&self, state: Value) {
        self.emit(EventPayload::StateSnapshot { state });
    }

    /// Emit a state delta.
    pub fn emit_delta(&self, patches: Vec<Patch>) {
        self.emit(EventPayload::StateDelta { patches });
    }

    /// Emit a single-field state update as an `add` patch.
    pub fn emit_field(&self, path: impl Into<String>, value: Value) {
        self.emit(EventPayload::StateDelta {
            patches: vec![Patch::add(path, value)],
        });
    }

    /// Emit a conversation snapshot.
    pub fn emit_messages_snapshot(&self, messages: Vec<Message>) {
        self.emit(EventPayload::MessagesSnapshot { messages });
    }

    /// Open an activity in the pending state.
    pub fn emit_activity_pending(&self, id: impl Into<String>, kind: ActivityKind, content: Value) {
        let mut content = content;
        if let Some(map) = content.as_object_mut() {
            map.insert(
                "status".to_owned(),
                Value::String(ActivityStatus::Pending.as_str().to_owned()),
            );
        }
        self.emit(EventPayload::ActivitySnapshot {
            id: id.into(),
            kind,
            content,
        });
    }

    /// Move an activity's `/status` field to a terminal value.
    pub fn emit_activity_status(
        &self,
        id: impl Into<String>,
        kind: ActivityKind,
        status: ActivityStatus,
    ) {
        self.emit(EventPayload::ActivityDelta {
            id: id.into(),
            kind,
            patches: vec![Patch::replace(
                "/status",
                Value::String(status.as_str().to_owned()),
            )],
        });
    }
}

/// The reading half of an event channel.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Receive the next event, or `None` once the channel has closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Drain the stream to completion, collecting every event.
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn emission_preserves_order() {
        let (sink, stream) = channel(8);
        sink.emit(EventPayload::RunStart);
        sink.emit(EventPayload::StepStart { name: "1".into() });
        sink.emit(EventPayload::RunEnd {
            reason: StopReason::Stop,
            pending_tool_calls: Vec::new(),
        });
        drop(sink);

        let events = stream.collect().await;
        assert!(matches!(events[0].payload, EventPayload::RunStart));
        assert!(matches!(events[1].payload, EventPayload::StepStart { .. }));
        assert!(matches!(events[2].payload, EventPayload::RunEnd { .. }));
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let (sink, stream) = channel(2);
        for _ in 0..10 {
            sink.emit(EventPayload::RunStart);
        }
        drop(sink);
        assert_eq!(stream.collect().await.len(), 2);
    }

    #[test]
    fn wire_format_is_type_tagged_camel_case() {
        let event = Event::new(EventPayload::RouteSelected {
            name: "triage".into(),
            route_name: "billing".into(),
        });
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "routeSelected");
        assert_eq!(wire["routeName"], "billing");
        assert!(wire["timestamp"].is_u64());

        let back: Event = serde_json::from_value(wire).unwrap();
        assert_eq!(back.payload, event.payload);
    }

    #[test]
    fn activity_pending_injects_status() {
        let (sink, mut stream) = channel(4);
        sink.emit_activity_pending(
            "a1",
            ActivityKind::ToolApproval,
            json!({"tool": "delete_file"}),
        );
        let event = stream.rx.try_recv().unwrap();
        let EventPayload::ActivitySnapshot { content, .. } = event.payload else {
            panic!("expected ActivitySnapshot");
        };
        assert_eq!(content["status"], "pending");
    }
}
