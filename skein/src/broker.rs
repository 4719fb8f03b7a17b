//! Request/response rendezvous between a run and an external decider.
//!
//! The approval broker (tool-approval gating) and the input broker
//! (user-input requests from steps) share one pattern: the producer parks a
//! request under a fresh id and blocks on a private reply channel; the
//! consumer resolves the id with a decision. The pending map's mutex is
//! never held across an await.
//!
//! Contracts: a request that times out resolves with `Timeout`; a request
//! whose context dies resolves with `Cancelled`; a decision for an unknown
//! id returns `UnknownRequest` without touching any run. Exactly one
//! decision is accepted per request.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::BrokerError;
use crate::event::now_ms;

/// Shared pending-request map keyed by request id.
struct Rendezvous<R> {
    pending: Mutex<HashMap<String, oneshot::Sender<R>>>,
}

impl<R> Default for Rendezvous<R> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<R> Rendezvous<R> {
    fn park(&self, id: String) -> oneshot::Receiver<R> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    fn resolve(&self, id: &str, reply: R) -> Result<(), BrokerError> {
        let tx = self.lock().remove(id).ok_or_else(|| BrokerError::UnknownRequest {
            id: id.to_owned(),
        })?;
        // A dropped receiver means the waiter already gave up (timeout or
        // cancellation won the race); report the id as unknown.
        tx.send(reply).map_err(|_| BrokerError::UnknownRequest {
            id: id.to_owned(),
        })
    }

    fn forget(&self, id: &str) {
        self.lock().remove(id);
    }

    fn pending_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<R>>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Wait for the reply, racing the per-request timeout and the context.
    async fn wait(
        &self,
        ctx: &RunContext,
        id: &str,
        timeout: Duration,
        rx: oneshot::Receiver<R>,
    ) -> Result<R, BrokerError> {
        let outcome = ctx.run_until(tokio::time::timeout(timeout, rx)).await;
        let result = match outcome {
            Err(_) => Err(BrokerError::Cancelled),
            Ok(Err(_elapsed)) => Err(BrokerError::Timeout),
            Ok(Ok(Err(_closed))) => Err(BrokerError::Cancelled),
            Ok(Ok(Ok(reply))) => Ok(reply),
        };
        if result.is_err() {
            self.forget(id);
        }
        result
    }
}

/// A pending tool-approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// The tool call awaiting a decision.
    pub tool_call_id: String,
    /// The tool name.
    pub tool: String,
    /// The raw call arguments.
    pub args: Value,
    /// Creation time, milliseconds since the unix epoch.
    pub created_at: u64,
}

impl ApprovalRequest {
    /// Create a request stamped with the current time.
    #[must_use]
    pub fn new(tool_call_id: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool: tool.into(),
            args,
            created_at: now_ms(),
        }
    }
}

/// A decision for a pending approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// The tool call the decision applies to.
    pub tool_call_id: String,
    /// Whether execution may proceed.
    pub approved: bool,
    /// Optional human-readable reason, surfaced on rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

type ApprovalObserver = dyn Fn(&ApprovalRequest) + Send + Sync;

/// Rendezvous broker for tool-approval decisions.
#[derive(Default)]
pub struct ApprovalBroker {
    rendezvous: Rendezvous<ApprovalDecision>,
    observer: Option<Arc<ApprovalObserver>>,
}

impl fmt::Debug for ApprovalBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalBroker")
            .field("pending", &self.rendezvous.pending_ids())
            .finish_non_exhaustive()
    }
}

impl ApprovalBroker {
    /// Create a broker with no observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker that publishes each new request to `observer`.
    ///
    /// The observer runs outside the pending-map lock, so it may call
    /// [`decide`](Self::decide) synchronously (an auto-approval policy).
    #[must_use]
    pub fn with_observer(observer: impl Fn(&ApprovalRequest) + Send + Sync + 'static) -> Self {
        Self {
            rendezvous: Rendezvous::default(),
            observer: Some(Arc::new(observer)),
        }
    }

    /// Park an approval request and wait for its decision.
    pub async fn request(
        &self,
        ctx: &RunContext,
        request: ApprovalRequest,
        timeout: Duration,
    ) -> Result<ApprovalDecision, BrokerError> {
        let id = request.tool_call_id.clone();
        let rx = self.rendezvous.park(id.clone());
        if let Some(observer) = &self.observer {
            observer(&request);
        }
        self.rendezvous.wait(ctx, &id, timeout, rx).await
    }

    /// Deliver a decision for a pending request.
    pub fn decide(
        &self,
        tool_call_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<(), BrokerError> {
        self.rendezvous.resolve(
            tool_call_id,
            ApprovalDecision {
                tool_call_id: tool_call_id.to_owned(),
                approved,
                reason,
            },
        )
    }

    /// Ids of requests still awaiting a decision.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        self.rendezvous.pending_ids()
    }
}

/// A pending user-input request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    /// Fresh request id.
    pub id: String,
    /// The prompt shown to the user.
    pub prompt: String,
    /// Creation time, milliseconds since the unix epoch.
    pub created_at: u64,
}

type InputObserver = dyn Fn(&InputRequest) + Send + Sync;

/// Rendezvous broker for free-form user input.
#[derive(Default)]
pub struct InputBroker {
    rendezvous: Rendezvous<String>,
    observer: Option<Arc<InputObserver>>,
}

impl fmt::Debug for InputBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputBroker")
            .field("pending", &self.rendezvous.pending_ids())
            .finish_non_exhaustive()
    }
}

impl InputBroker {
    /// Create a broker with no observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker that publishes each new request to `observer`.
    #[must_use]
    pub fn with_observer(observer: impl Fn(&InputRequest) + Send + Sync + 'static) -> Self {
        Self {
            rendezvous: Rendezvous::default(),
            observer: Some(Arc::new(observer)),
        }
    }

    /// Publish a prompt under a fresh id and wait for the user's reply.
    pub async fn request(
        &self,
        ctx: &RunContext,
        prompt: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, BrokerError> {
        let request = InputRequest {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            created_at: now_ms(),
        };
        let rx = self.rendezvous.park(request.id.clone());
        if let Some(observer) = &self.observer {
            observer(&request);
        }
        self.rendezvous.wait(ctx, &request.id, timeout, rx).await
    }

    /// Deliver the user's reply for a pending request.
    pub fn respond(&self, id: &str, value: impl Into<String>) -> Result<(), BrokerError> {
        self.rendezvous.resolve(id, value.into())
    }

    /// Ids of requests still awaiting a reply.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        self.rendezvous.pending_ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn decision_reaches_the_waiter() {
        let broker = Arc::new(ApprovalBroker::new());
        let ctx = RunContext::new();

        let waiter = {
            let broker = Arc::clone(&broker);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                broker
                    .request(&ctx, ApprovalRequest::new("t1", "delete_file", json!({})), WAIT)
                    .await
            })
        };

        // Spin until the request is parked, then decide.
        while broker.pending_ids().is_empty() {
            tokio::task::yield_now().await;
        }
        broker
            .decide("t1", false, Some("not allowed".into()))
            .unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.reason.as_deref(), Some("not allowed"));
        assert!(broker.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn unknown_id_is_rejected_without_side_effects() {
        let broker = ApprovalBroker::new();
        let err = broker.decide("nope", true, None);
        assert!(matches!(err, Err(BrokerError::UnknownRequest { id }) if id == "nope"));
    }

    #[tokio::test]
    async fn only_the_first_decision_counts() {
        let broker = Arc::new(ApprovalBroker::new());
        let ctx = RunContext::new();
        let waiter = {
            let broker = Arc::clone(&broker);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                broker
                    .request(&ctx, ApprovalRequest::new("t1", "rm", json!({})), WAIT)
                    .await
            })
        };
        while broker.pending_ids().is_empty() {
            tokio::task::yield_now().await;
        }
        broker.decide("t1", true, None).unwrap();
        assert!(broker.decide("t1", false, None).is_err());
        assert!(waiter.await.unwrap().unwrap().approved);
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out() {
        let broker = ApprovalBroker::new();
        let ctx = RunContext::new();
        let result = broker
            .request(
                &ctx,
                ApprovalRequest::new("t1", "rm", json!({})),
                Duration::from_millis(50),
            )
            .await;
        assert_eq!(result, Err(BrokerError::Timeout));
        assert!(broker.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn cancellation_resolves_pending_requests() {
        let broker = Arc::new(ApprovalBroker::new());
        let ctx = RunContext::new();
        let waiter = {
            let broker = Arc::clone(&broker);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                broker
                    .request(&ctx, ApprovalRequest::new("t1", "rm", json!({})), WAIT)
                    .await
            })
        };
        while broker.pending_ids().is_empty() {
            tokio::task::yield_now().await;
        }
        ctx.cancel();
        assert_eq!(waiter.await.unwrap(), Err(BrokerError::Cancelled));
        assert!(broker.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn observer_can_auto_respond() {
        // An observer that answers immediately, outside the pending-map lock.
        let answering: Arc<InputBroker> = Arc::new_cyclic(|weak: &std::sync::Weak<InputBroker>| {
            let weak = weak.clone();
            InputBroker::with_observer(move |req| {
                if let Some(broker) = weak.upgrade() {
                    let _ = broker.respond(&req.id, "blue");
                }
            })
        });

        let ctx = RunContext::new();
        let reply = answering
            .request(&ctx, "favourite colour?", WAIT)
            .await
            .unwrap();
        assert_eq!(reply, "blue");
    }
}
