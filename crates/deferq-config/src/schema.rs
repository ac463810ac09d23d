//! Configuration schema definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use deferq_workqueue::{TidyupConfig, WorkerConfig};

use crate::error::ConfigError;
use crate::loader::ConfigLoader;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub tidyup: TidyupConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "database.path".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        self.worker.validate()?;
        self.tidyup.validate()?;
        Ok(())
    }
}

/// Task database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path; `~` is expanded.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(ConfigLoader::expand_path(&self.path))
    }
}

fn default_db_path() -> String {
    deferq_dir().join("tasks.db").to_string_lossy().into_owned()
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; console only when unset.
    #[serde(default)]
    pub dir: Option<String>,
}

impl LoggingConfig {
    /// Log directory with `~` expanded.
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir
            .as_deref()
            .map(|dir| PathBuf::from(ConfigLoader::expand_path(dir)))
    }
}

/// Get the ~/.deferq directory path.
pub fn deferq_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".deferq"))
        .unwrap_or_else(|| PathBuf::from(".deferq"))
}
