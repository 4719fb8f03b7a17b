//! Concurrent fan-out over branch copies of the shared state.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::event::EventPayload;
use crate::state::SharedState;

use super::step::{Step, run_step};

/// Merges branch state copies back into the parent after a fan-out.
pub trait Aggregator: Send + Sync {
    /// Fold the branch copies, in declaration order, into the parent.
    fn merge(&self, parent: &mut SharedState, branches: Vec<SharedState>);
}

/// Shallow overwrite in declaration order: later branches win on key
/// collisions. Suitable only when branches write disjoint keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverwriteAggregator;

impl Aggregator for OverwriteAggregator {
    fn merge(&self, parent: &mut SharedState, branches: Vec<SharedState>) {
        for branch in branches {
            parent.merge_overwrite(branch);
        }
    }
}

/// Runs each child concurrently against a forked state.
///
/// Each branch receives a shallow copy of the parent state; the aggregator
/// merges the copies after **all** branches return, so a failing branch
/// never leaves orphaned siblings running. On failure the first error in
/// declaration order is returned.
pub struct Parallel {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    aggregator: Box<dyn Aggregator>,
}

impl std::fmt::Debug for Parallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Parallel")
            .field("name", &self.name)
            .field("branches", &names)
            .finish_non_exhaustive()
    }
}

impl Parallel {
    /// Create an empty fan-out with the default overwrite aggregator.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            aggregator: Box::new(OverwriteAggregator),
        }
    }

    /// Add a branch.
    #[must_use]
    pub fn branch(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Replace the aggregator.
    #[must_use]
    pub fn with_aggregator(mut self, aggregator: impl Aggregator + 'static) -> Self {
        self.aggregator = Box::new(aggregator);
        self
    }
}

#[async_trait]
impl Step for Parallel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        ctx.emit(EventPayload::ParallelStart {
            name: self.name.clone(),
        });

        let mut handles = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let step = Arc::clone(step);
            let ctx = ctx.clone();
            let mut branch_state = state.fork();
            handles.push(tokio::spawn(async move {
                let result = run_step(step.as_ref(), &ctx, &mut branch_state).await;
                (result, branch_state)
            }));
        }

        // Join every branch before reporting, in declaration order.
        let joined = join_all(handles).await;

        ctx.emit(EventPayload::ParallelEnd {
            name: self.name.clone(),
        });

        let mut first_error: Option<Error> = None;
        let mut branches = Vec::with_capacity(joined.len());
        for outcome in joined {
            match outcome {
                Ok((Ok(()), branch_state)) => branches.push(branch_state),
                Ok((Err(err), _)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error =
                            Some(Error::internal(format!("parallel branch panicked: {join_err}")));
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        self.aggregator.merge(state, branches);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FuncStep;
    use serde_json::json;
    use std::time::Duration;

    fn setter(name: &'static str, key: &'static str, value: i64) -> FuncStep {
        FuncStep::from_sync(name, move |state| {
            state.set_raw(key, json!(value));
            Ok(())
        })
    }

    #[tokio::test]
    async fn branches_merge_disjoint_keys() {
        let parallel = Parallel::new("fan")
            .branch(setter("a", "a", 1))
            .branch(setter("b", "b", 2));
        let mut state = SharedState::new();
        parallel.run(&RunContext::new(), &mut state).await.unwrap();
        assert_eq!(state.get_raw("a"), Some(&json!(1)));
        assert_eq!(state.get_raw("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn declaration_order_breaks_merge_ties() {
        let parallel = Parallel::new("fan")
            .branch(setter("first", "k", 1))
            .branch(setter("second", "k", 2));
        let mut state = SharedState::new();
        parallel.run(&RunContext::new(), &mut state).await.unwrap();
        assert_eq!(state.get_raw("k"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn failure_waits_for_siblings_and_reports_first_error() {
        let slow_ok = FuncStep::new("slow", |_ctx, state| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                state.set_raw("slow_done", json!(true));
                Ok(())
            })
        });
        let fast_fail = FuncStep::from_sync("fast", |_| {
            Err(Error::configuration("fast branch failed"))
        });

        // Declaration order: the failing branch is second, but it is still
        // the first error since the slow branch succeeds.
        let parallel = Parallel::new("fan").branch(slow_ok).branch(fast_fail);
        let mut state = SharedState::new();
        let err = parallel.run(&RunContext::new(), &mut state).await.unwrap_err();
        assert!(err.to_string().contains("fast branch failed"));
        // Parent state untouched on failure.
        assert!(state.get_raw("slow_done").is_none());
    }

    #[tokio::test]
    async fn first_error_in_declaration_order_wins() {
        let fail = |name: &'static str, msg: &'static str| {
            FuncStep::new(name, move |_ctx, _state| {
                Box::pin(async move {
                    // The later-declared branch fails faster.
                    if msg == "second" {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Err(Error::configuration(msg))
                })
            })
        };
        let parallel = Parallel::new("fan")
            .branch(fail("a", "first"))
            .branch(fail("b", "second"));
        let err = parallel
            .run(&RunContext::new(), &mut SharedState::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("first"));
    }
}
