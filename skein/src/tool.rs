//! Tool definitions and the name→handler registry.
//!
//! A tool is either *server-side* (registered with a handler) or
//! *client-side* (schema only; the run hands control back to the caller
//! when the model calls it). Handlers receive the run context and the raw
//! JSON arguments string from the model, and return plain string content.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::{Error, Result};

/// Schema-level description of a tool, as sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name, snake_case by convention.
    pub name: String,
    /// What the tool does; guides the model's tool choice.
    pub description: String,
    /// JSON schema for the arguments object.
    pub parameters: Value,
}

impl ToolSpec {
    /// Create a new tool spec.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A server-side tool implementation.
///
/// Handlers must honor cancellation via the context and decode their own
/// arguments; a decode failure should surface as `Error::Tool` so the loop
/// can turn it into an error result the model can react to.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool against the raw JSON arguments string.
    async fn call(&self, ctx: &RunContext, raw_args: &str) -> Result<String>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Adapter lifting a plain closure into a [`ToolHandler`].
pub struct FnTool<F> {
    f: F,
}

impl<F> FnTool<F>
where
    F: Fn(RunContext, String) -> HandlerFuture + Send + Sync,
{
    /// Wrap a closure. The closure receives an owned context clone and the
    /// raw arguments string.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnTool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> ToolHandler for FnTool<F>
where
    F: Fn(RunContext, String) -> HandlerFuture + Send + Sync,
{
    async fn call(&self, ctx: &RunContext, raw_args: &str) -> Result<String> {
        (self.f)(ctx.clone(), raw_args.to_owned()).await
    }
}

#[derive(Clone)]
struct Entry {
    spec: ToolSpec,
    handler: Option<Arc<dyn ToolHandler>>,
}

/// Name→(spec, handler) registry with exclusive-name semantics.
///
/// Registration of an existing name fails; unregistration is idempotent.
/// The registry is read-mostly once a run has started and is safe for
/// concurrent resolution.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<HashMap<String, Entry>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.list().into_iter().map(|s| s.name).collect::<Vec<_>>();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server-side tool.
    ///
    /// # Errors
    ///
    /// `DuplicateTool` when the name is already registered.
    pub fn register(&self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Result<()> {
        self.insert(spec, Some(handler))
    }

    /// Register a server-side tool from a closure.
    pub fn register_fn<F>(&self, spec: ToolSpec, f: F) -> Result<()>
    where
        F: Fn(RunContext, String) -> HandlerFuture + Send + Sync + 'static,
    {
        self.register(spec, Arc::new(FnTool::new(f)))
    }

    /// Register a client-side tool: schema only, no handler. The agent loop
    /// terminates with `reason = client_tools` when the model calls it.
    pub fn register_client(&self, spec: ToolSpec) -> Result<()> {
        self.insert(spec, None)
    }

    fn insert(&self, spec: ToolSpec, handler: Option<Arc<dyn ToolHandler>>) -> Result<()> {
        let mut map = self.write_lock();
        if map.contains_key(&spec.name) {
            return Err(Error::DuplicateTool { name: spec.name });
        }
        map.insert(spec.name.clone(), Entry { spec, handler });
        Ok(())
    }

    /// Remove a tool. Removing an absent name is a no-op.
    pub fn unregister(&self, name: &str) {
        self.write_lock().remove(name);
    }

    /// Look up a tool, returning its spec and handler (when server-side).
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<(ToolSpec, Option<Arc<dyn ToolHandler>>)> {
        self.read_lock()
            .get(name)
            .map(|e| (e.spec.clone(), e.handler.clone()))
    }

    /// All registered tool specs, sorted by name for stable provider
    /// requests.
    #[must_use]
    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> =
            self.read_lock().values().map(|e| e.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Register client tools for the duration of the returned guard.
    ///
    /// Dropping the guard removes the registrations, giving callers the
    /// guaranteed cleanup path required for scoped client tools.
    pub fn scoped_client(self: &Arc<Self>, specs: Vec<ToolSpec>) -> Result<ScopedTools> {
        let mut registered: Vec<String> = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            if let Err(err) = self.register_client(spec) {
                for done in &registered {
                    self.unregister(done);
                }
                return Err(err);
            }
            registered.push(name);
        }
        Ok(ScopedTools {
            registry: Arc::clone(self),
            names: registered,
        })
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// RAII guard for scoped client-tool registrations.
#[derive(Debug)]
pub struct ScopedTools {
    registry: Arc<ToolRegistry>,
    names: Vec<String>,
}

impl ScopedTools {
    /// The names registered by this guard.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for ScopedTools {
    fn drop(&mut self) {
        for name in &self.names {
            self.registry.unregister(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_spec() -> ToolSpec {
        ToolSpec::new(
            "get_weather",
            "Returns the weather for a city.",
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        )
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = ToolRegistry::new();
        registry.register_client(weather_spec()).unwrap();
        let err = registry.register_client(weather_spec());
        assert!(matches!(err, Err(Error::DuplicateTool { name }) if name == "get_weather"));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ToolRegistry::new();
        registry.register_client(weather_spec()).unwrap();
        registry.unregister("get_weather");
        registry.unregister("get_weather");
        assert!(registry.resolve("get_weather").is_none());
    }

    #[tokio::test]
    async fn fn_tool_dispatch() {
        let registry = ToolRegistry::new();
        registry
            .register_fn(weather_spec(), |_ctx, args| {
                Box::pin(async move {
                    let v: Value = serde_json::from_str(&args)
                        .map_err(|e| Error::tool("get_weather", e.to_string()))?;
                    Ok(format!("72F in {}", v["city"].as_str().unwrap_or("?")))
                })
            })
            .unwrap();

        let (_, handler) = registry.resolve("get_weather").unwrap();
        let out = handler
            .unwrap()
            .call(&RunContext::new(), r#"{"city":"NYC"}"#)
            .await
            .unwrap();
        assert_eq!(out, "72F in NYC");
    }

    #[test]
    fn client_tools_have_no_handler() {
        let registry = ToolRegistry::new();
        registry.register_client(weather_spec()).unwrap();
        let (spec, handler) = registry.resolve("get_weather").unwrap();
        assert_eq!(spec.name, "get_weather");
        assert!(handler.is_none());
    }

    #[test]
    fn scoped_registration_cleans_up() {
        let registry = Arc::new(ToolRegistry::new());
        {
            let guard = registry
                .scoped_client(vec![weather_spec(), ToolSpec::new("ui_prompt", "", json!({}))])
                .unwrap();
            assert_eq!(guard.names().len(), 2);
            assert!(registry.resolve("ui_prompt").is_some());
        }
        assert!(registry.resolve("ui_prompt").is_none());
        assert!(registry.resolve("get_weather").is_none());
    }

    #[test]
    fn scoped_registration_rolls_back_on_conflict() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register_client(weather_spec()).unwrap();
        let err = registry.scoped_client(vec![
            ToolSpec::new("fresh", "", json!({})),
            weather_spec(),
        ]);
        assert!(err.is_err());
        assert!(registry.resolve("fresh").is_none());
    }
}
