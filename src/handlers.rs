//! Built-in task handlers registered by `deferq run`.

use async_trait::async_trait;
use tracing::info;

use deferq_workqueue::{Task, TaskHandler};

/// Returns the task context as its result.
pub(crate) struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<String> {
        Ok(task.context.clone())
    }
}

/// Writes the task context to the log.
pub(crate) struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<String> {
        info!(
            "Task {} (object {}): {}",
            task.id, task.object_id, task.context
        );
        Ok(String::new())
    }
}
