//! The composable workflow engine: a step interface plus sequential,
//! parallel, conditional, and looping combinators over shared state.
//!
//! Steps emit events through the run context's forwarding channel; the
//! [`WorkflowRegistry`] owns run framing and exposes named workflows as
//! event streams.

mod chain;
mod loops;
mod parallel;
mod prompt;
mod registry;
mod router;
mod step;

pub use chain::Chain;
pub use loops::Loop;
pub use parallel::{Aggregator, OverwriteAggregator, Parallel};
pub use prompt::{PromptStep, TypedPromptStep};
pub use registry::WorkflowRegistry;
pub use router::{ClassifierRouter, Route, Router};
pub use step::{FuncStep, Step};
