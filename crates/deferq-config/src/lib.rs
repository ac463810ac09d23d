//! # deferq Config
//!
//! Configuration file loading for the deferq host process.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
