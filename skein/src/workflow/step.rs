//! The step interface and the function adapter.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::Result;
use crate::event::EventPayload;
use crate::state::SharedState;

/// One node in a workflow step tree.
///
/// A step mutates the shared state and may emit events through the
/// context's forwarding channel. Errors short-circuit the enclosing
/// combinator and travel up the tree.
#[async_trait]
pub trait Step: Send + Sync {
    /// The step name, used in lifecycle events and error wrapping.
    fn name(&self) -> &str;

    /// Execute the step.
    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()>;
}

/// Run a step with lifecycle framing: a liveness check, `StepStart`, the
/// step body, then `StepEnd` on success. Errors carry the step name.
pub(crate) async fn run_step(
    step: &dyn Step,
    ctx: &RunContext,
    state: &mut SharedState,
) -> Result<()> {
    ctx.check_live()?;
    let name = step.name().to_owned();
    ctx.emit(EventPayload::StepStart { name: name.clone() });
    match step.run(ctx, state).await {
        Ok(()) => {
            ctx.emit(EventPayload::StepEnd { name });
            Ok(())
        }
        Err(err) => Err(err.in_step(name)),
    }
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
type StepFn = Box<dyn for<'a> Fn(&'a RunContext, &'a mut SharedState) -> StepFuture<'a> + Send + Sync>;

/// Adapter lifting a plain function into a [`Step`].
pub struct FuncStep {
    name: String,
    f: StepFn,
}

impl std::fmt::Debug for FuncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncStep").field("name", &self.name).finish_non_exhaustive()
    }
}

impl FuncStep {
    /// Lift an async function.
    ///
    /// ```rust,ignore
    /// FuncStep::new("fetch", |ctx, state| Box::pin(async move { … }));
    /// ```
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a RunContext, &'a mut SharedState) -> StepFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }

    /// Lift a synchronous state transform.
    pub fn from_sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut SharedState) -> Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(name, move |_ctx, state| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(state) })
        })
    }
}

#[async_trait]
impl Step for FuncStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        (self.f)(ctx, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TypedKey;

    const COUNT: TypedKey<u64> = TypedKey::new("count");

    #[tokio::test]
    async fn sync_adapter_mutates_state() {
        let step = FuncStep::from_sync("bump", |state| {
            let next = state.get(&COUNT).unwrap_or(0) + 1;
            state.set(&COUNT, next);
            Ok(())
        });
        let ctx = RunContext::new();
        let mut state = SharedState::new();
        step.run(&ctx, &mut state).await.unwrap();
        step.run(&ctx, &mut state).await.unwrap();
        assert_eq!(state.get(&COUNT).unwrap(), 2);
    }

    #[tokio::test]
    async fn framing_wraps_errors_with_the_step_name() {
        let step = FuncStep::from_sync("explode", |_| {
            Err(crate::error::Error::configuration("bad"))
        });
        let ctx = RunContext::new();
        let mut state = SharedState::new();
        let err = run_step(&step, &ctx, &mut state).await.unwrap_err();
        assert!(err.to_string().starts_with("step 'explode'"));
    }
}
