//! Task Invocation
//!
//! The engine calls every external unit of work through [`TaskInvoker`].
//! An invoker performs exactly one call per request and returns the raw
//! output unchanged; it never retries, never interprets the output and never
//! touches the execution context. Merging output is the caller's job.
//!
//! Provided implementations:
//! - [`InvokerRegistry`]: routes by resource reference to other invokers
//! - [`FnInvoker`]: wraps an async closure, for in-process tasks
//! - [`CommandInvoker`](super::command::CommandInvoker): runs an executable

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::error::InvocationError;

/// Calls a named external unit of work.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    /// Invokes `resource` with the projected `input`.
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, InvocationError>;
}

#[async_trait]
impl<T: TaskInvoker + ?Sized> TaskInvoker for Arc<T> {
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, InvocationError> {
        (**self).invoke(resource, input).await
    }
}

/// Routes each resource reference to the invoker registered for it.
#[derive(Default, Clone)]
pub struct InvokerRegistry {
    routes: HashMap<String, Arc<dyn TaskInvoker>>,
    fallback: Option<Arc<dyn TaskInvoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `invoker` for `resource`, replacing any previous route.
    pub fn register(&mut self, resource: impl Into<String>, invoker: Arc<dyn TaskInvoker>) {
        self.routes.insert(resource.into(), invoker);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, resource: impl Into<String>, invoker: impl TaskInvoker + 'static) -> Self {
        self.register(resource, Arc::new(invoker));
        self
    }

    /// Invoker used for resources without an explicit route.
    pub fn with_fallback(mut self, invoker: Arc<dyn TaskInvoker>) -> Self {
        self.fallback = Some(invoker);
        self
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.routes.contains_key(resource)
    }

    /// Registered resource names, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TaskInvoker for InvokerRegistry {
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, InvocationError> {
        let invoker = self
            .routes
            .get(resource)
            .or(self.fallback.as_ref())
            .ok_or_else(|| InvocationError::new(resource, "no invoker registered for resource"))?;

        debug!("Routing invocation of '{}'", resource);
        invoker.invoke(resource, input).await
    }
}

/// In-process task backed by an async closure.
///
/// # Example
///
/// ```
/// use maprunner::execution::invoker::{FnInvoker, InvokerRegistry};
/// use serde_json::{json, Value};
///
/// let registry = InvokerRegistry::new().with(
///     "double",
///     FnInvoker::new(|input: Value| async move {
///         match input["n"].as_i64() {
///             Some(n) => Ok(json!(n * 2)),
///             None => Err("n must be an integer".to_string()),
///         }
///     }),
/// );
/// assert!(registry.contains("double"));
/// ```
pub struct FnInvoker<F> {
    handler: F,
}

impl<F, Fut> FnInvoker<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> TaskInvoker for FnInvoker<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, InvocationError> {
        (self.handler)(input)
            .await
            .map_err(|cause| InvocationError::new(resource, cause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> FnInvoker<impl Fn(Value) -> std::future::Ready<Result<Value, String>>> {
        FnInvoker::new(|input| std::future::ready(Ok::<Value, String>(input)))
    }

    #[tokio::test]
    async fn test_fn_invoker_returns_raw_output() {
        let invoker = echo();
        let output = invoker.invoke("echo", json!({"a": [1, 2]})).await.unwrap();
        assert_eq!(output, json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_fn_invoker_error_carries_resource() {
        let invoker = FnInvoker::new(|_| async { Err::<Value, _>("model throttled".to_string()) });
        let err = invoker.invoke("invoke_model", json!({})).await.unwrap_err();

        assert_eq!(err.resource, "invoke_model");
        assert_eq!(err.cause, "model throttled");
    }

    #[tokio::test]
    async fn test_registry_routes_by_resource() {
        let registry = InvokerRegistry::new()
            .with("echo", echo())
            .with("constant", FnInvoker::new(|_| async { Ok::<_, String>(json!(42)) }));

        assert_eq!(registry.invoke("constant", json!(null)).await.unwrap(), json!(42));
        assert_eq!(registry.invoke("echo", json!("x")).await.unwrap(), json!("x"));
        assert_eq!(registry.resources(), vec!["constant", "echo"]);
    }

    #[tokio::test]
    async fn test_registry_unknown_resource() {
        let registry = InvokerRegistry::new().with("echo", echo());
        let err = registry.invoke("missing", json!({})).await.unwrap_err();

        assert_eq!(err.resource, "missing");
        assert!(err.cause.contains("no invoker"));
    }

    #[tokio::test]
    async fn test_registry_fallback() {
        let registry = InvokerRegistry::new().with_fallback(Arc::new(echo()));
        assert_eq!(registry.invoke("anything", json!(1)).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_arc_invoker_delegates() {
        let shared: Arc<dyn TaskInvoker> = Arc::new(echo());
        assert_eq!(shared.invoke("echo", json!(true)).await.unwrap(), json!(true));
    }
}
