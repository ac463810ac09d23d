//! Configuration errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<deferq_workqueue::QueueError> for ConfigError {
    fn from(e: deferq_workqueue::QueueError) -> Self {
        ConfigError::InvalidValue {
            field: "queue".to_string(),
            message: e.to_string(),
        }
    }
}
