//! Handler registry keyed by task type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::task::Task;

/// Task handler trait.
///
/// The returned string is stored as the task result. An error marks the task
/// failed and its rendering is stored instead.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute a task.
    async fn handle(&self, task: &Task) -> anyhow::Result<String>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    async fn handle(&self, task: &Task) -> anyhow::Result<String> {
        (self.0)(task.clone()).await
    }
}

/// Mutable `task_type -> handler` map. Registering a type again replaces the
/// previous handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(task_type.into(), handler);
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&self, task_type: impl Into<String>, f: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler(f)));
    }

    /// Remove a handler.
    pub fn unregister(&self, task_type: &str) -> bool {
        self.handlers.write().remove(task_type).is_some()
    }

    /// Look up a handler.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_type).cloned()
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;

    struct Fixed(&'static str);

    #[async_trait]
    impl TaskHandler for Fixed {
        async fn handle(&self, _task: &Task) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = HandlerRegistry::new();
        registry.register("a", Arc::new(Fixed("one")));

        let task = NewTask::new(1, "a", "").into_task(1);
        let handler = registry.get("a").unwrap();
        assert_eq!(handler.handle(&task).await.unwrap(), "one");
        assert!(registry.get("b").is_none());
    }

    #[tokio::test]
    async fn test_reregister_overwrites() {
        let registry = HandlerRegistry::new();
        registry.register("a", Arc::new(Fixed("one")));
        registry.register("a", Arc::new(Fixed("two")));

        let task = NewTask::new(1, "a", "").into_task(1);
        let out = registry.get("a").unwrap().handle(&task).await.unwrap();
        assert_eq!(out, "two");
        assert_eq!(registry.task_types(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_register_fn_sees_context() {
        let registry = HandlerRegistry::new();
        registry.register_fn("echo", |task: Task| async move { Ok(task.context) });

        let task = NewTask::new(1, "echo", "hi").into_task(1);
        let out = registry.get("echo").unwrap().handle(&task).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry.register("a", Arc::new(Fixed("one")));
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.task_types().is_empty());
    }
}
