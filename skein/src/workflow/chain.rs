//! Sequential composition of steps.

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::Result;
use crate::state::SharedState;

use super::step::{Step, run_step};

/// Executes children in declared order over the shared state.
///
/// The first error short-circuits; each child observes the mutations made
/// by its predecessors.
pub struct Chain {
    name: String,
    steps: Vec<Box<dyn Step>>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.steps.iter().map(|s| s.name()).collect();
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("steps", &names)
            .finish()
    }
}

impl Chain {
    /// Create an empty chain.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a child step.
    #[must_use]
    pub fn then(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a boxed child step.
    #[must_use]
    pub fn then_boxed(mut self, step: Box<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }
}

#[async_trait]
impl Step for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        for step in &self.steps {
            run_step(step.as_ref(), ctx, state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::state::TypedKey;
    use crate::workflow::FuncStep;

    const TRAIL: TypedKey<String> = TypedKey::new("trail");

    fn appender(name: &'static str, tag: &'static str) -> FuncStep {
        FuncStep::from_sync(name, move |state| {
            let mut trail = state.get(&TRAIL).unwrap_or_default();
            trail.push_str(tag);
            state.set(&TRAIL, trail);
            Ok(())
        })
    }

    #[tokio::test]
    async fn children_run_in_declared_order() {
        let chain = Chain::new("pipeline")
            .then(appender("a", "a"))
            .then(appender("b", "b"))
            .then(appender("c", "c"));
        let mut state = SharedState::new();
        chain.run(&RunContext::new(), &mut state).await.unwrap();
        assert_eq!(state.get(&TRAIL).unwrap(), "abc");
    }

    #[tokio::test]
    async fn first_error_short_circuits() {
        let chain = Chain::new("pipeline")
            .then(appender("a", "a"))
            .then(FuncStep::from_sync("boom", |_| {
                Err(Error::configuration("nope"))
            }))
            .then(appender("c", "c"));
        let mut state = SharedState::new();
        let err = chain.run(&RunContext::new(), &mut state).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(state.get(&TRAIL).unwrap(), "a");
    }
}
