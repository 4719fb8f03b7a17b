//! Run-level options for agent invocations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{ApprovalBroker, InputBroker};
use crate::context::ApprovalSet;
use crate::message::Message;
use crate::retry::RetrySettings;

/// Observational per-step callback: `(step, messages-so-far)`.
///
/// Callback failures are the caller's concern; the loop never aborts on
/// their account.
pub type StepCallback = Arc<dyn Fn(usize, &[Message]) + Send + Sync>;

/// Options for a single agent run.
///
/// Fields left unset fall back to the values carried by the
/// [`RunContext`](crate::context::RunContext).
#[derive(Clone)]
pub struct AgentOptions {
    /// Step budget for the loop. Defaults to 10.
    pub max_steps: usize,
    /// Wall-clock budget for the whole run.
    pub timeout: Option<Duration>,
    /// Tool names that require approval before execution.
    pub approval: ApprovalSet,
    /// The decider for gated tool calls.
    pub approver: Option<Arc<ApprovalBroker>>,
    /// The broker answering user-input requests from tools.
    pub input_broker: Option<Arc<InputBroker>>,
    /// How long a single approval request may stay pending. Defaults to 60s.
    pub approval_timeout: Duration,
    /// Retry settings for provider calls; `None` uses the context's.
    pub retry: Option<RetrySettings>,
    /// Cap on concurrently executing tool calls within one step.
    pub max_tool_concurrency: Option<usize>,
    /// Observational callback fired at the end of each step.
    pub on_step: Option<StepCallback>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_steps: 10,
            timeout: None,
            approval: ApprovalSet::none(),
            approver: None,
            input_broker: None,
            approval_timeout: Duration::from_secs(60),
            retry: None,
            max_tool_concurrency: None,
            on_step: None,
        }
    }
}

impl fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentOptions")
            .field("max_steps", &self.max_steps)
            .field("timeout", &self.timeout)
            .field("approval", &self.approval)
            .field("approval_timeout", &self.approval_timeout)
            .field("retry", &self.retry)
            .field("max_tool_concurrency", &self.max_tool_concurrency)
            .field("on_step", &self.on_step.as_ref().map(|_| "…"))
            .finish_non_exhaustive()
    }
}

impl AgentOptions {
    /// Options with a step budget.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Options with a run timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Options with an approval policy and decider.
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalSet, approver: Arc<ApprovalBroker>) -> Self {
        self.approval = approval;
        self.approver = Some(approver);
        self
    }

    /// Options with a user-input broker.
    #[must_use]
    pub fn with_input_broker(mut self, broker: Arc<InputBroker>) -> Self {
        self.input_broker = Some(broker);
        self
    }

    /// Options with explicit retry settings.
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Options with a per-step callback.
    #[must_use]
    pub fn with_on_step(mut self, on_step: impl Fn(usize, &[Message]) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Arc::new(on_step));
        self
    }
}
