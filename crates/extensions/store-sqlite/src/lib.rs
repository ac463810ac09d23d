//! SQLite task store for deferq.
//!
//! Provides durable task rows using SQLite.

mod schema;
mod store;

pub use schema::TASKS_TABLE;
pub use store::SqliteTaskStore;
