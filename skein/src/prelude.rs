//! Convenience re-exports for common usage.

pub use crate::agent::{Agent, AgentOptions, RunOutcome};
pub use crate::broker::{ApprovalBroker, ApprovalDecision, ApprovalRequest, InputBroker};
pub use crate::context::{ApprovalSet, RunContext};
pub use crate::error::{BrokerError, Error, Result, StateError};
pub use crate::event::{
    ActivityKind, ActivityStatus, Event, EventPayload, EventSink, EventStream, StopReason,
};
pub use crate::mapper::{DepthMapper, ProtocolEvent};
pub use crate::message::{ContentPart, Message, Role, ToolCall, ToolResult};
pub use crate::patch::{Patch, PatchOp};
pub use crate::provider::{ChatProvider, ChatRequest, ChatResponse, MockProvider, ProviderChunk};
pub use crate::retry::RetrySettings;
pub use crate::state::{SharedState, TypedKey};
pub use crate::tool::{ToolHandler, ToolRegistry, ToolSpec};
pub use crate::usage::Usage;
pub use crate::workflow::{
    Aggregator, Chain, ClassifierRouter, FuncStep, Loop, OverwriteAggregator, Parallel,
    PromptStep, Route, Router, Step, TypedPromptStep, WorkflowRegistry,
};
