//! Per-invocation run context: cancellation, deadline, event forwarding,
//! approval policy, and provider overrides.
//!
//! Every blocking operation in the core (provider calls, approval waits,
//! handler execution, backoff sleeps) races against this context via
//! [`RunContext::run_until`], so cancelling the context or letting the
//! deadline elapse interrupts the run at its next suspension point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use crate::broker::{ApprovalBroker, InputBroker};
use crate::error::{Error, Result};
use crate::event::{EventPayload, EventSink};
use crate::retry::RetrySettings;

/// The set of tool names that require an approval decision before execution.
///
/// An empty set auto-approves everything; the `"*"` wildcard holds every
/// call pending.
#[derive(Debug, Clone, Default)]
pub struct ApprovalSet {
    names: HashSet<String>,
}

impl ApprovalSet {
    /// An empty set: every tool is auto-approved.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// A wildcard set: every tool requires approval.
    #[must_use]
    pub fn all() -> Self {
        let mut names = HashSet::new();
        names.insert("*".to_owned());
        Self { names }
    }

    /// Build a set from tool names.
    #[must_use]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Add a tool name.
    pub fn insert(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    /// Whether a call to `name` must be held pending.
    #[must_use]
    pub fn requires_approval(&self, name: &str) -> bool {
        self.names.contains("*") || self.names.contains(name)
    }

    /// Whether the set is empty (auto-approve all).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Context for a single run invocation.
///
/// Cloning is cheap; [`child`](Self::child) derives a context whose
/// cancellation follows the parent's, for nested runs started from tool
/// handlers.
#[derive(Debug, Clone)]
pub struct RunContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    forward: Option<EventSink>,
    approval: ApprovalSet,
    approver: Option<Arc<ApprovalBroker>>,
    input: Option<Arc<InputBroker>>,
    retry: RetrySettings,
    model: Option<String>,
    max_steps: Option<usize>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// A fresh context with no deadline and default retry settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            forward: None,
            approval: ApprovalSet::none(),
            approver: None,
            input: None,
            retry: RetrySettings::default(),
            model: None,
            max_steps: None,
        }
    }

    /// Set a timeout, measured from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Attach the forwarding event sink.
    #[must_use]
    pub fn with_forward(mut self, sink: EventSink) -> Self {
        self.forward = Some(sink);
        self
    }

    /// Set the approval policy.
    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalSet) -> Self {
        self.approval = approval;
        self
    }

    /// Attach the approval broker.
    #[must_use]
    pub fn with_approver(mut self, approver: Arc<ApprovalBroker>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Attach the user-input broker.
    #[must_use]
    pub fn with_input_broker(mut self, input: Arc<InputBroker>) -> Self {
        self.input = Some(input);
        self
    }

    /// Set the retry settings for provider calls made under this context.
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Override the model for provider calls made under this context.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Override the step budget.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Derive a context for a nested run. Cancellation propagates from this
    /// context to the child; the forwarding sink and overrides are shared.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child
    }

    /// The cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the deadline has elapsed.
    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the context is no longer live.
    pub fn check_live(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline_exceeded() {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Race a future against cancellation and the deadline.
    ///
    /// Resolves to `Err(Cancelled)` or `Err(DeadlineExceeded)` when the
    /// context dies first; the future is dropped at that point.
    pub async fn run_until<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => Err(Error::Cancelled),
                    () = tokio::time::sleep_until(deadline.into()) => Err(Error::DeadlineExceeded),
                    out = fut => Ok(out),
                }
            }
            None => {
                tokio::select! {
                    () = self.cancel.cancelled() => Err(Error::Cancelled),
                    out = fut => Ok(out),
                }
            }
        }
    }

    /// The forwarding event sink, when one is attached.
    #[must_use]
    pub fn forward(&self) -> Option<&EventSink> {
        self.forward.as_ref()
    }

    /// Emit an event onto the forwarding sink, if any.
    pub fn emit(&self, payload: EventPayload) {
        if let Some(sink) = &self.forward {
            sink.emit(payload);
        }
    }

    /// The approval policy.
    #[must_use]
    pub fn approval(&self) -> &ApprovalSet {
        &self.approval
    }

    /// The approval broker, when one is attached.
    #[must_use]
    pub fn approver(&self) -> Option<&Arc<ApprovalBroker>> {
        self.approver.as_ref()
    }

    /// The user-input broker, when one is attached.
    #[must_use]
    pub fn input_broker(&self) -> Option<&Arc<InputBroker>> {
        self.input.as_ref()
    }

    /// The retry settings.
    #[must_use]
    pub fn retry(&self) -> RetrySettings {
        self.retry
    }

    /// The model override, if any.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// The step-budget override, if any.
    #[must_use]
    pub fn max_steps(&self) -> Option<usize> {
        self.max_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_set_wildcard() {
        assert!(!ApprovalSet::none().requires_approval("rm"));
        assert!(ApprovalSet::all().requires_approval("rm"));
        let set = ApprovalSet::from_names(["delete_file"]);
        assert!(set.requires_approval("delete_file"));
        assert!(!set.requires_approval("get_weather"));
    }

    #[tokio::test]
    async fn run_until_observes_cancellation() {
        let ctx = RunContext::new();
        ctx.cancel();
        let out = ctx.run_until(std::future::pending::<()>()).await;
        assert!(matches!(out, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_observes_deadline() {
        let ctx = RunContext::new().with_timeout(Duration::from_millis(10));
        let out = ctx.run_until(std::future::pending::<()>()).await;
        assert!(matches!(out, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn child_follows_parent_cancellation() {
        let parent = RunContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
