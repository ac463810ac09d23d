//! Task persistence store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::QueueError;
use crate::task::{NewTask, ObjectId, Task, TaskCounts, TaskId, TaskPatch};

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Task store trait for persistence.
///
/// The row is the source of truth; every state transition is a column update.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Ensure the backing schema exists. Idempotent.
    async fn migrate(&self) -> Result<(), QueueError>;

    /// Insert a new row and return it with its assigned ID.
    /// Rows whose timestamps fail [`NewTask::validate`] are rejected unwritten.
    async fn insert(&self, task: NewTask) -> Result<Task, QueueError>;

    /// Load a task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError>;

    /// Load up to `limit` undone, unclaimed rows ordered by `start_time`
    /// ascending, unset first.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Task>, QueueError>;

    /// Apply a patch. Returns false when the row does not exist.
    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, QueueError>;

    /// Mark every undone row of `object_id` as done. Returns the affected count.
    async fn cancel_pending(&self, object_id: ObjectId) -> Result<u64, QueueError>;

    /// Delete up to `limit` done, non-failed rows, oldest created first.
    async fn delete_succeeded(&self, limit: usize) -> Result<u64, QueueError>;

    /// Claim an undone, unclaimed row for `worker`. Returns false if someone
    /// else got there first or the row is already done.
    async fn claim(&self, id: TaskId, worker: &str) -> Result<bool, QueueError>;

    /// Release claims held by `worker` on undone rows.
    async fn release_claims(&self, worker: &str) -> Result<u64, QueueError>;

    /// Row counts per status.
    async fn counts(&self) -> Result<TaskCounts, QueueError>;
}

/// In-memory task store for testing and embedding.
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
    next_id: AtomicI64,
}

impl MemoryTaskStore {
    /// Create a new memory store.
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Check if the store holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn migrate(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn insert(&self, task: NewTask) -> Result<Task, QueueError> {
        task.validate()?;
        let mut tasks = self.tasks.write().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = task.into_task(id);
        tasks.insert(id, task.clone());
        debug!("Inserted task {} ({})", id, task.task_type);
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let tasks = self.tasks.read().await;
        let mut pending: Vec<Task> = tasks
            .values()
            .filter(|t| !t.done && t.claimed_by.is_none())
            .cloned()
            .collect();
        // None < Some(_), so immediately eligible rows come first.
        pending.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, QueueError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) => {
                task.apply(patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cancel_pending(&self, object_id: ObjectId) -> Result<u64, QueueError> {
        let mut tasks = self.tasks.write().await;
        let patch = TaskPatch::cancelled();
        let mut affected = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.object_id == object_id && !t.done)
        {
            task.apply(&patch);
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_succeeded(&self, limit: usize) -> Result<u64, QueueError> {
        let mut tasks = self.tasks.write().await;
        let mut victims: Vec<(chrono::DateTime<chrono::Utc>, TaskId)> = tasks
            .values()
            .filter(|t| t.done && !t.failed)
            .map(|t| (t.created_at, t.id))
            .collect();
        victims.sort();
        victims.truncate(limit);
        for (_, id) in &victims {
            tasks.remove(id);
        }
        Ok(victims.len() as u64)
    }

    async fn claim(&self, id: TaskId, worker: &str) -> Result<bool, QueueError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if !task.done && task.claimed_by.is_none() => {
                task.claimed_by = Some(worker.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claims(&self, worker: &str) -> Result<u64, QueueError> {
        let mut tasks = self.tasks.write().await;
        let mut released = 0;
        for task in tasks
            .values_mut()
            .filter(|t| !t.done && t.claimed_by.as_deref() == Some(worker))
        {
            task.claimed_by = None;
            released += 1;
        }
        Ok(released)
    }

    async fn counts(&self) -> Result<TaskCounts, QueueError> {
        let tasks = self.tasks.read().await;
        let mut counts = TaskCounts::default();
        for task in tasks.values() {
            counts.add(task.status());
        }
        Ok(counts)
    }
}
