//! Producer-facing lifecycle operations.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::error::QueueError;
use crate::store::TaskStore;
use crate::task::{NewTask, ObjectId, TaskCounts, TaskId};

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;

/// Enqueue, cancel and tidy up tasks in a [`TaskStore`].
///
/// Task types are not checked against any handler registry here; an unknown
/// type only surfaces when a worker dispatches the row.
#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
}

impl TaskManager {
    /// Create a manager, ensuring the schema exists first.
    pub async fn new(store: Arc<dyn TaskStore>) -> Result<Self, QueueError> {
        store.migrate().await.map_err(|e| {
            error!("Task store migration failed: {}", e);
            e
        })?;
        Ok(Self { store })
    }

    /// Get the underlying store.
    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    /// Insert a pending task. A positive `delay` defers eligibility.
    ///
    /// A delay whose start time cannot be stored is rejected before anything
    /// is written.
    pub async fn enqueue(
        &self,
        object_id: ObjectId,
        task_type: &str,
        context: &str,
        delay: Duration,
    ) -> Result<TaskId, QueueError> {
        let new = NewTask::new(object_id, task_type, context).with_delay(delay)?;
        let task = self.store.insert(new).await?;
        debug!(
            "Enqueued task {} (type: {}, object: {}, delay: {:?})",
            task.id, task_type, object_id, delay
        );
        Ok(task.id)
    }

    /// Mark every pending task of `object_id` as done without running it.
    pub async fn cancel_all(&self, object_id: ObjectId) -> Result<u64, QueueError> {
        let cancelled = self.store.cancel_pending(object_id).await?;
        if cancelled > 0 {
            info!("Cancelled {} pending tasks for object {}", cancelled, object_id);
        }
        Ok(cancelled)
    }

    /// Delete up to `max_count` successfully finished tasks, oldest first.
    /// Failed rows are kept for inspection.
    pub async fn tidyup(&self, max_count: usize) -> Result<u64, QueueError> {
        let deleted = self.store.delete_succeeded(max_count).await?;
        if deleted > 0 {
            info!("Tidy-up removed {} finished tasks (limit {})", deleted, max_count);
        }
        Ok(deleted)
    }

    /// Row counts per status.
    pub async fn counts(&self) -> Result<TaskCounts, QueueError> {
        self.store.counts().await
    }
}
