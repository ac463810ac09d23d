//! Task definition, patch and status.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::QueueError;

/// Last year a stored timestamp may fall in. Timestamps are kept as
/// four-digit-year RFC 3339 text so they sort and parse back.
pub const MAX_TIME_YEAR: i32 = 9999;

/// Store-assigned task identifier.
pub type TaskId = i64;

/// Caller-supplied correlation key, used only for cancellation grouping.
pub type ObjectId = i64;

/// Task status, derived from the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not yet dispatched.
    Pending,
    /// Marked done without ever being dispatched.
    Cancelled,
    /// Handler returned a result.
    Succeeded,
    /// Handler errored, panicked, timed out, or the type was unknown.
    Failed,
}

impl TaskStatus {
    /// Derive the status from the stored flags.
    ///
    /// Every dispatch stamps `exec_time`, so a done row that was never
    /// executed was cancelled.
    pub fn from_flags(done: bool, failed: bool, executed: bool) -> Self {
        match (done, failed, executed) {
            (false, _, _) => TaskStatus::Pending,
            (true, _, false) => TaskStatus::Cancelled,
            (true, true, true) => TaskStatus::Failed,
            (true, false, true) => TaskStatus::Succeeded,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: TaskId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Handler selector.
    pub task_type: String,
    /// Correlation key (e.g. the entity this task concerns).
    pub object_id: ObjectId,
    /// Attempted or cancelled.
    pub done: bool,
    /// Outcome flag, meaningful once `done` is set.
    pub failed: bool,
    /// Opaque payload handed to the handler.
    pub context: String,
    /// Opaque handler output.
    pub result: String,
    /// Not eligible before this instant (None = immediately).
    pub start_time: Option<DateTime<Utc>>,
    /// Dispatch start.
    pub exec_time: Option<DateTime<Utc>>,
    /// Dispatch end.
    pub end_time: Option<DateTime<Utc>>,
    /// Worker holding the dispatch claim.
    pub claimed_by: Option<String>,
}

impl Task {
    /// Check if the task can be dispatched at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        if self.done {
            return false;
        }
        match self.start_time {
            Some(start) => start <= now,
            None => true,
        }
    }

    /// Check if the task can be dispatched now.
    pub fn is_eligible(&self) -> bool {
        self.is_eligible_at(Utc::now())
    }

    /// Derive the status from the row.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_flags(self.done, self.failed, self.exec_time.is_some())
    }

    /// Apply a patch in place.
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(done) = patch.done {
            self.done = done;
        }
        if let Some(failed) = patch.failed {
            self.failed = failed;
        }
        if let Some(result) = &patch.result {
            self.result = result.clone();
        }
        if let Some(exec_time) = patch.exec_time {
            self.exec_time = Some(exec_time);
        }
        if let Some(end_time) = patch.end_time {
            self.end_time = Some(end_time);
        }
        if let Some(claimed_by) = &patch.claimed_by {
            self.claimed_by = claimed_by.clone();
        }
    }
}

/// Values for a row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub created_at: DateTime<Utc>,
    pub task_type: String,
    pub object_id: ObjectId,
    pub context: String,
    pub start_time: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Create a task that is eligible immediately.
    pub fn new(object_id: ObjectId, task_type: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            task_type: task_type.into(),
            object_id,
            context: context.into(),
            start_time: None,
        }
    }

    /// Delay eligibility; a zero delay leaves the task immediately eligible.
    ///
    /// Fails when the resulting start time cannot be represented.
    pub fn with_delay(mut self, delay: Duration) -> Result<Self, QueueError> {
        if delay.is_zero() {
            self.start_time = None;
            return Ok(self);
        }

        let start = ChronoDuration::from_std(delay)
            .ok()
            .and_then(|d| self.created_at.checked_add_signed(d))
            .ok_or_else(|| QueueError::InvalidTask(format!("delay {:?} is out of range", delay)))?;
        check_time("start time", start)?;
        self.start_time = Some(start);
        Ok(self)
    }

    /// Set an absolute start time. Range is checked by [`NewTask::validate`].
    pub fn with_start_time(mut self, time: DateTime<Utc>) -> Self {
        self.start_time = Some(time);
        self
    }

    /// Check that every timestamp fits the stored range.
    pub fn validate(&self) -> Result<(), QueueError> {
        check_time("creation time", self.created_at)?;
        if let Some(start) = self.start_time {
            check_time("start time", start)?;
        }
        Ok(())
    }

    /// Materialize the row once the store has assigned an ID.
    pub fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            created_at: self.created_at,
            task_type: self.task_type,
            object_id: self.object_id,
            done: false,
            failed: false,
            context: self.context,
            result: String::new(),
            start_time: self.start_time,
            exec_time: None,
            end_time: None,
            claimed_by: None,
        }
    }
}

fn check_time(what: &str, time: DateTime<Utc>) -> Result<(), QueueError> {
    if (0..=MAX_TIME_YEAR).contains(&time.year()) {
        Ok(())
    } else {
        Err(QueueError::InvalidTask(format!(
            "{} {} is outside years 0000-{}",
            what, time, MAX_TIME_YEAR
        )))
    }
}

/// Partial update of a task row. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub done: Option<bool>,
    pub failed: Option<bool>,
    pub result: Option<String>,
    pub exec_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// `Some(None)` clears the claim.
    pub claimed_by: Option<Option<String>>,
}

impl TaskPatch {
    /// The outcome group written once a dispatch finishes.
    pub fn completed(
        exec_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        result: impl Into<String>,
        failed: bool,
    ) -> Self {
        Self {
            done: Some(true),
            failed: Some(failed),
            result: Some(result.into()),
            exec_time: Some(exec_time),
            end_time: Some(end_time),
            claimed_by: None,
        }
    }

    /// Administrative cancellation: only `done` changes.
    pub fn cancelled() -> Self {
        Self {
            done: Some(true),
            ..Default::default()
        }
    }

    /// Check if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub cancelled: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl TaskCounts {
    /// Tally one status.
    pub fn add(&mut self, status: TaskStatus) {
        self.add_many(status, 1);
    }

    /// Tally `n` rows of one status.
    pub fn add_many(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Cancelled => self.cancelled += n,
            TaskStatus::Succeeded => self.succeeded += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    /// Total number of rows.
    pub fn total(&self) -> u64 {
        self.pending + self.cancelled + self.succeeded + self.failed
    }
}
