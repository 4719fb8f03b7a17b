//! Named workflow entry points producing the unified event stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{error, info, info_span};
use tracing::Instrument as _;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::event::{DEFAULT_CAPACITY, EventPayload, EventStream, StopReason, channel};
use crate::message::Message;
use crate::state::SharedState;

use super::step::{Step, run_step};

/// Registry of named runnable workflows.
///
/// A workflow is any root [`Step`]; the runner owns `RunStart`/`RunEnd`
/// framing and forwards every step-level event onto the run's channel.
#[derive(Default)]
pub struct WorkflowRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Step>>>,
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.names())
            .finish()
    }
}

impl WorkflowRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its root step's name.
    ///
    /// # Errors
    ///
    /// `DuplicateTool`-style exclusivity: registering an existing name
    /// fails with a configuration error.
    pub fn register(&self, workflow: Arc<dyn Step>) -> Result<()> {
        let name = workflow.name().to_owned();
        let mut map = self.write_lock();
        if map.contains_key(&name) {
            return Err(Error::configuration(format!(
                "workflow '{name}' is already registered"
            )));
        }
        map.insert(name, workflow);
        Ok(())
    }

    /// Remove a workflow. Removing an absent name is a no-op.
    pub fn unregister(&self, name: &str) {
        self.write_lock().remove(name);
    }

    /// Look up a workflow by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.read_lock().get(name).cloned()
    }

    /// Registered workflow names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start the named workflow with an input message, returning its event
    /// stream.
    ///
    /// # Errors
    ///
    /// `UnknownWorkflow` surfaces synchronously, before any events.
    pub fn run_stream(
        &self,
        ctx: RunContext,
        name: &str,
        input: Message,
    ) -> Result<EventStream> {
        let workflow = self.get(name).ok_or_else(|| Error::UnknownWorkflow {
            name: name.to_owned(),
        })?;

        let (sink, stream) = channel(DEFAULT_CAPACITY);
        let ctx = ctx.with_forward(sink.clone());
        let workflow_name = name.to_owned();

        tokio::spawn(
            async move {
                sink.emit(EventPayload::RunStart);
                let mut state = SharedState::with_message(input);
                sink.emit_snapshot(state.snapshot());

                match run_step(workflow.as_ref(), &ctx, &mut state).await {
                    Ok(()) => {
                        info!(workflow = %workflow_name, "workflow run completed");
                        sink.emit_snapshot(state.snapshot());
                        sink.emit(EventPayload::RunEnd {
                            reason: StopReason::Stop,
                            pending_tool_calls: Vec::new(),
                        });
                    }
                    Err(err) => {
                        error!(workflow = %workflow_name, error = %err, "workflow run failed");
                        sink.emit(EventPayload::RunError {
                            error: err.to_string(),
                        });
                    }
                }
            }
            .instrument(info_span!("workflow_run", workflow = %name)),
        );

        Ok(stream)
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Step>>> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn Step>>> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FuncStep;
    use serde_json::json;

    fn trivial(name: &'static str) -> Arc<dyn Step> {
        Arc::new(FuncStep::from_sync(name, |state| {
            state.set_raw("done", json!(true));
            Ok(())
        }))
    }

    #[tokio::test]
    async fn unknown_workflow_fails_synchronously() {
        let registry = WorkflowRegistry::new();
        let result = registry.run_stream(RunContext::new(), "nope", Message::user("hi"));
        assert!(matches!(result, Err(Error::UnknownWorkflow { name }) if name == "nope"));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let registry = WorkflowRegistry::new();
        registry.register(trivial("wf")).unwrap();
        assert!(registry.register(trivial("wf")).is_err());
        assert_eq!(registry.names(), ["wf"]);
    }

    #[tokio::test]
    async fn run_is_framed_by_lifecycle_events() {
        let registry = WorkflowRegistry::new();
        registry.register(trivial("wf")).unwrap();

        let stream = registry
            .run_stream(RunContext::new(), "wf", Message::user("go"))
            .unwrap();
        let events = stream.collect().await;

        assert!(matches!(events.first().unwrap().payload, EventPayload::RunStart));
        assert!(matches!(
            events.last().unwrap().payload,
            EventPayload::RunEnd { reason: StopReason::Stop, .. }
        ));
        assert!(events
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::StepStart { name } if name == "wf")));
    }
}
