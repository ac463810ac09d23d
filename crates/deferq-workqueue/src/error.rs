//! Queue errors.

use thiserror::Error;

use crate::task::TaskId;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Storage failure (query, insert, update, delete or connectivity).
    #[error("Database error: {0}")]
    Database(String),

    /// Task values the store cannot hold (e.g. an out-of-range start time).
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Configuration rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}
