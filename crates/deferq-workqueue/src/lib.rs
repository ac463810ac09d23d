//! # deferq workqueue
//!
//! Persistent, delayed task queue backed by a row-per-task store.
//!
//! ## Features
//!
//! - Producer API: enqueue with optional delay, cancel by object, tidy-up
//! - Polling worker with a type-keyed handler registry
//! - Panic and timeout isolation per task
//! - Optional row claiming so several workers can share one store
//! - Pluggable storage via [`TaskStore`] (in-memory store included)

pub mod config;
pub mod error;
pub mod manager;
pub mod registry;
pub mod store;
pub mod task;
pub mod worker;

pub use config::{TidyupConfig, WorkerConfig};
pub use error::QueueError;
pub use manager::TaskManager;
pub use registry::{HandlerRegistry, TaskHandler};
pub use store::{MemoryTaskStore, TaskStore};
pub use task::{
    NewTask, ObjectId, Task, TaskCounts, TaskId, TaskPatch, TaskStatus, MAX_TIME_YEAR,
};
pub use worker::{PollReport, Worker, WorkerHandle, WorkerStats};
