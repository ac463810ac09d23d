//! Queue configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name, recorded as the claimant of dispatched rows.
    #[serde(default = "default_name")]
    pub name: String,

    /// Poll interval in milliseconds.
    #[serde(default = "default_pull_interval")]
    pub pull_interval_ms: u64,

    /// Maximum number of rows fetched per poll.
    #[serde(default = "default_pull_task_num")]
    pub pull_task_num: usize,

    /// Maximum number of handlers running at once within a batch.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-task handler deadline in seconds (0 = no deadline).
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

fn default_name() -> String {
    "worker".to_string()
}

fn default_pull_interval() -> u64 {
    1000
}

fn default_pull_task_num() -> usize {
    20
}

fn default_max_concurrent() -> usize {
    4
}

fn default_task_timeout() -> u64 {
    60
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            pull_interval_ms: default_pull_interval(),
            pull_task_num: default_pull_task_num(),
            max_concurrent: default_max_concurrent(),
            task_timeout_secs: default_task_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Create a config with the given worker name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the poll interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        // Sub-millisecond intervals round up instead of collapsing to zero.
        self.pull_interval_ms = if millis == 0 && !interval.is_zero() { 1 } else { millis };
        self
    }

    /// Set the batch size.
    pub fn with_pull_task_num(mut self, n: usize) -> Self {
        self.pull_task_num = n;
        self
    }

    /// Set the concurrency limit.
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Set the handler deadline in seconds.
    pub fn with_task_timeout_secs(mut self, secs: u64) -> Self {
        self.task_timeout_secs = secs;
        self
    }

    /// Poll interval as a duration.
    pub fn pull_interval(&self) -> Duration {
        Duration::from_millis(self.pull_interval_ms)
    }

    /// Handler deadline, if any.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    /// Check that the values can drive a poll loop.
    pub fn validate(&self) -> Result<(), crate::QueueError> {
        if self.pull_interval_ms == 0 {
            return Err(crate::QueueError::InvalidConfig(
                "pull_interval_ms must be positive".to_string(),
            ));
        }
        if self.pull_task_num == 0 {
            return Err(crate::QueueError::InvalidConfig(
                "pull_task_num must be positive".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(crate::QueueError::InvalidConfig(
                "max_concurrent must be positive".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(crate::QueueError::InvalidConfig(
                "worker name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retention settings for the periodic tidy-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TidyupConfig {
    /// Seconds between tidy-up runs.
    #[serde(default = "default_tidyup_interval")]
    pub interval_secs: u64,

    /// Maximum rows deleted per tidy-up run.
    #[serde(default = "default_tidyup_max_count")]
    pub max_count: usize,
}

fn default_tidyup_interval() -> u64 {
    300
}

fn default_tidyup_max_count() -> usize {
    1000
}

impl Default for TidyupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_tidyup_interval(),
            max_count: default_tidyup_max_count(),
        }
    }
}

impl TidyupConfig {
    /// Tidy-up interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), crate::QueueError> {
        if self.interval_secs == 0 {
            return Err(crate::QueueError::InvalidConfig(
                "tidyup interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
