//! Handler registry
//!
//! Maps a task's `type` tag to the handler family that processes it. Handlers return
//! raw output bytes; the processor encodes and stores them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use distributask_core::models::Task;
use distributask_core::TaskError;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one attempt of `task`.
    ///
    /// Return [`TaskError::validation`] for input that can never succeed and
    /// [`TaskError::transient`] for anything worth retrying.
    async fn handle(&self, task: &Task) -> Result<Vec<u8>, TaskError>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`, replacing any previous one.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        tracing::debug!(task_type = %task_type, "Registered task handler");
        self.handlers.insert(task_type, handler);
    }

    pub fn with_handler(
        mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Handler for `task_type`.
    ///
    /// An unregistered type is a validation error: no attempt can succeed.
    pub fn resolve(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>, TaskError> {
        self.get(task_type).ok_or_else(|| {
            TaskError::validation(anyhow::anyhow!(
                "unimplemented: no handler registered for task type '{}'",
                task_type
            ))
        })
    }

    /// Run the handler registered for `task.task_type`.
    pub async fn dispatch(&self, task: &Task) -> Result<Vec<u8>, TaskError> {
        self.resolve(&task.task_type)?.handle(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use distributask_core::models::{Priority, TaskStatus};

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, task: &Task) -> Result<Vec<u8>, TaskError> {
            Ok(task.task_type.as_bytes().to_vec())
        }
    }

    fn task(task_type: &str) -> Task {
        Task {
            id: 1,
            owner_id: 1,
            task_type: task_type.to_string(),
            payload: serde_json::json!({}),
            priority: Priority::Default,
            status: TaskStatus::Pending,
            timeout_seconds: 30,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            result: None,
            last_error: None,
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let registry = HandlerRegistry::new().with_handler("echo", Arc::new(Echo));
        assert!(registry.contains("echo"));
        assert_eq!(registry.task_types(), vec!["echo"]);
        assert_eq!(registry.dispatch(&task("echo")).await.unwrap(), b"echo");
    }

    #[tokio::test]
    async fn test_unknown_type_is_terminal() {
        let registry = HandlerRegistry::new();
        let err = registry.dispatch(&task("video_transcode")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("video_transcode"));

        let err = registry.resolve("video_transcode").err().unwrap();
        assert!(err.to_string().starts_with("unimplemented"));
    }
}
