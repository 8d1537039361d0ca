//! Handler registry: opaque handler names mapped to callable units
//!
//! The core's only contract with user code is name-in, result-or-error-out.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::breaker::DegradationStrategy;
use crate::broker::Broker;
use crate::retry::HandlerError;
use crate::task::Task;

/// What a handler returns: a JSON result or a classified error
pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Boxed handler future
pub type HandlerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send>>;

/// Registered handler function
pub type TaskHandler = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// Everything a handler may consult during an attempt
pub struct HandlerContext {
    pub task: Task,

    /// Cooperative cancellation; checked at handler-defined checkpoints
    pub cancel: CancellationToken,

    broker: Arc<dyn Broker>,
}

impl HandlerContext {
    pub fn new(task: Task, cancel: CancellationToken, broker: Arc<dyn Broker>) -> Self {
        Self {
            task,
            cancel,
            broker,
        }
    }

    /// Active degradation strategy for a named dependency, if any
    pub async fn degradation(&self, dependency: &str) -> Option<DegradationStrategy> {
        self.broker.degradation(dependency).await.ok().flatten()
    }
}

/// Name -> handler mapping shared by a worker's dispatch loops
///
/// # Example
///
/// ```
/// use taskflow_core::worker::HandlerRegistry;
///
/// let registry = HandlerRegistry::new();
/// registry.register("send_email", |ctx| async move {
///     let to = ctx.task.descriptor.kwargs.get("to").cloned();
///     Ok(serde_json::json!({"sent": true, "to": to}))
/// });
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: std::sync::RwLock<HashMap<String, TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task name
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers
            .write()
            .unwrap()
            .insert(name.to_string(), handler);
    }

    /// Look up a handler by task name
    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.handlers.read().unwrap().get(name).cloned()
    }

    /// Registered handler names
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::task::TaskDescriptor;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = HandlerRegistry::new();
        registry.register("double", |ctx| async move {
            let n = ctx.task.descriptor.kwargs["n"].as_i64().unwrap_or(0);
            Ok(serde_json::json!(n * 2))
        });

        let handler = registry.get("double").unwrap();
        let task = Task::from_descriptor(
            TaskDescriptor::new("double").with_kwarg("n", serde_json::json!(21)),
        );
        let ctx = HandlerContext::new(
            task,
            CancellationToken::new(),
            Arc::new(MemoryBroker::new()),
        );

        let result = handler(ctx).await.unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_names() {
        let registry = HandlerRegistry::new();
        registry.register("a", |_| async { Ok(serde_json::Value::Null) });
        registry.register("b", |_| async { Ok(serde_json::Value::Null) });

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
