//! Conditional routing: predicate-driven and classifier-driven.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::event::EventPayload;
use crate::message::Message;
use crate::provider::{ChatProvider, ChatRequest};
use crate::retry;
use crate::state::SharedState;

use super::step::{Step, run_step};

type Predicate = Box<dyn Fn(&SharedState) -> bool + Send + Sync>;

/// A named route: a predicate over the state plus the step to run.
pub struct Route {
    name: String,
    predicate: Predicate,
    step: Box<dyn Step>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Route {
    /// Create a route.
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&SharedState) -> bool + Send + Sync + 'static,
        step: impl Step + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            step: Box::new(step),
        }
    }
}

/// Evaluates routes in declared order and runs the first match.
///
/// Non-selected routes are reported as skipped; when nothing matches, the
/// optional default step runs.
pub struct Router {
    name: String,
    routes: Vec<Route>,
    default: Option<Box<dyn Step>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.routes.iter().map(|r| r.name.as_str()).collect();
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("routes", &names)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router with no routes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            default: None,
        }
    }

    /// Add a route.
    #[must_use]
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Set the default step, run when no predicate matches.
    #[must_use]
    pub fn default_step(mut self, step: impl Step + 'static) -> Self {
        self.default = Some(Box::new(step));
        self
    }
}

#[async_trait]
impl Step for Router {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        let selected = self.routes.iter().position(|r| (r.predicate)(state));

        match selected {
            Some(index) => {
                let route = &self.routes[index];
                debug!(router = %self.name, route = %route.name, "route selected");
                ctx.emit(EventPayload::RouteSelected {
                    name: self.name.clone(),
                    route_name: route.name.clone(),
                });
                for (i, other) in self.routes.iter().enumerate() {
                    if i != index {
                        ctx.emit(EventPayload::StepSkipped {
                            name: other.name.clone(),
                        });
                    }
                }
                run_step(route.step.as_ref(), ctx, state).await
            }
            None => match &self.default {
                Some(step) => {
                    ctx.emit(EventPayload::RouteSelected {
                        name: self.name.clone(),
                        route_name: step.name().to_owned(),
                    });
                    for route in &self.routes {
                        ctx.emit(EventPayload::StepSkipped {
                            name: route.name.clone(),
                        });
                    }
                    run_step(step.as_ref(), ctx, state).await
                }
                None => Ok(()),
            },
        }
    }
}

/// A router whose selection is made by an LLM call.
///
/// The classifier prompt lists the route names; the model must answer with
/// exactly one of them. An unrecognized answer falls back to the default
/// step, or fails when none is configured.
pub struct ClassifierRouter {
    name: String,
    provider: Arc<dyn ChatProvider>,
    model: String,
    routes: Vec<(String, Box<dyn Step>)>,
    default: Option<Box<dyn Step>>,
}

impl std::fmt::Debug for ClassifierRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.routes.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("ClassifierRouter")
            .field("name", &self.name)
            .field("routes", &names)
            .finish_non_exhaustive()
    }
}

impl ClassifierRouter {
    /// Create a classifier router.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            model: model.into(),
            routes: Vec::new(),
            default: None,
        }
    }

    /// Add a named route.
    #[must_use]
    pub fn route(mut self, name: impl Into<String>, step: impl Step + 'static) -> Self {
        self.routes.push((name.into(), Box::new(step)));
        self
    }

    /// Set the default step for unrecognized classifications.
    #[must_use]
    pub fn default_step(mut self, step: impl Step + 'static) -> Self {
        self.default = Some(Box::new(step));
        self
    }

    fn classifier_messages(&self, state: &SharedState) -> Vec<Message> {
        let route_names: Vec<&str> = self.routes.iter().map(|(n, _)| n.as_str()).collect();
        let mut messages = vec![Message::system(format!(
            "You are a router. Reply with exactly one of the following route \
             names and nothing else: {}",
            route_names.join(", ")
        ))];
        messages.extend(state.messages().iter().cloned());
        messages
    }
}

#[async_trait]
impl Step for ClassifierRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: &mut SharedState) -> Result<()> {
        let model = ctx.model().unwrap_or(&self.model);
        let request = ChatRequest::new(model, self.classifier_messages(state));
        let response = retry::retry(ctx, ctx.retry(), ctx.forward(), || {
            self.provider.chat(&request)
        })
        .await?;

        let answer = response.text().unwrap_or_default().trim().to_owned();
        let selected = self
            .routes
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(&answer));

        match selected {
            Some(index) => {
                let (route_name, step) = &self.routes[index];
                ctx.emit(EventPayload::RouteSelected {
                    name: self.name.clone(),
                    route_name: route_name.clone(),
                });
                for (i, (other, _)) in self.routes.iter().enumerate() {
                    if i != index {
                        ctx.emit(EventPayload::StepSkipped { name: other.clone() });
                    }
                }
                run_step(step.as_ref(), ctx, state).await
            }
            None => match &self.default {
                Some(step) => {
                    ctx.emit(EventPayload::RouteSelected {
                        name: self.name.clone(),
                        route_name: step.name().to_owned(),
                    });
                    run_step(step.as_ref(), ctx, state).await
                }
                None => Err(Error::unmarshal(
                    format!("workflow: step \"{}\"", self.name),
                    format!("classifier answered '{answer}', not a known route"),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::workflow::FuncStep;
    use serde_json::json;

    fn marker(name: &'static str) -> FuncStep {
        FuncStep::from_sync(name, move |state| {
            state.set_raw("ran", json!(name));
            Ok(())
        })
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let router = Router::new("triage")
            .route(Route::new("billing", |s| s.contains("billing"), marker("billing_step")))
            .route(Route::new("always", |_| true, marker("always_step")));
        let mut state = SharedState::new();
        router.run(&RunContext::new(), &mut state).await.unwrap();
        assert_eq!(state.get_raw("ran"), Some(&json!("always_step")));

        let mut state = SharedState::new();
        state.set_raw("billing", json!(true));
        router.run(&RunContext::new(), &mut state).await.unwrap();
        assert_eq!(state.get_raw("ran"), Some(&json!("billing_step")));
    }

    #[tokio::test]
    async fn no_match_runs_default() {
        let router = Router::new("triage")
            .route(Route::new("never", |_| false, marker("never_step")))
            .default_step(marker("fallback"));
        let mut state = SharedState::new();
        router.run(&RunContext::new(), &mut state).await.unwrap();
        assert_eq!(state.get_raw("ran"), Some(&json!("fallback")));
    }

    #[tokio::test]
    async fn classifier_selects_by_model_answer() {
        let provider = Arc::new(MockProvider::new().text("refunds"));
        let router = ClassifierRouter::new("triage", provider, "mock-model")
            .route("sales", marker("sales_step"))
            .route("refunds", marker("refunds_step"));
        let mut state = SharedState::with_message(Message::user("I want my money back"));
        router.run(&RunContext::new(), &mut state).await.unwrap();
        assert_eq!(state.get_raw("ran"), Some(&json!("refunds_step")));
    }

    #[tokio::test]
    async fn classifier_unknown_answer_without_default_fails() {
        let provider = Arc::new(MockProvider::new().text("gibberish"));
        let router = ClassifierRouter::new("triage", provider, "mock-model")
            .route("sales", marker("sales_step"));
        let err = router
            .run(&RunContext::new(), &mut SharedState::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unmarshal { .. }));
    }
}
