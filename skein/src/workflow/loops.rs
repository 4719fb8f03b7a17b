//! Bounded repetition of a body step.

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::Result;
use crate::event::EventPayload;
use crate::state::SharedState;

use super::step::{Step, run_step};

type UntilFn = Box<dyn Fn(&SharedState) -> bool + Send + Sync>;

/// Runs its body up to `max_iterations` times.
///
/// The optional `until` predicate is evaluated before each entry and stops
/// the loop once it holds; a body error terminates immediately.
pub struct Loop {
    name: String,
    body: Box<dyn Step>,
    max_iterations: usize,
    until: Option<UntilFn>,
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("name", &self.name)
            .field("body", &self.body.name())
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

impl Loop {
    /// Create a loop over `body` with an iteration budget.
    #[must_use]
    pub fn new(name: impl Into<String>, body: impl Step + 'static, max_iterations: usize) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
            max_iterations,
            until: None,
        }
    }

    /// Stop early once the predicate holds.
    #[must_use]
    pub fn until(mut self, predicate: impl Fn(&SharedState) -> bool + Send + Sync + 'static) -> Self {
        self.until = Some(Box::new(predicate));
        self
    }
}

#[async_trait]
impl Step for Loop {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        for iteration in 1..=self.max_iterations {
            if self.until.as_ref().is_some_and(|p| p(state)) {
                break;
            }
            ctx.emit(EventPayload::LoopIteration {
                name: self.name.clone(),
                iteration,
            });
            run_step(self.body.as_ref(), ctx, state).await?;
        }
        Ok(())
    }
}
