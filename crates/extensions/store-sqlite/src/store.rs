//! SQLite task store implementation.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::debug;

use deferq_workqueue::{
    NewTask, ObjectId, QueueError, Task, TaskCounts, TaskId, TaskPatch, TaskStatus, TaskStore,
};

use crate::schema::init_schema;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

const COLUMNS: &str = "id, created_at, task_type, object_id, done, failed, context, result, \
                       start_time, exec_time, end_time, claimed_by";

/// SQLite-based task store.
///
/// All statements run on a single background connection, so calls are
/// serialized and each one is atomic.
pub struct SqliteTaskStore {
    conn: Connection,
}

impl SqliteTaskStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().await.map_err(db_err)?;

        conn.call(|conn| Ok(init_schema(conn)?))
            .await
            .map_err(db_err)?;

        Ok(Self { conn })
    }

    /// Create a new file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening task database at {:?}", path);
        let conn = Connection::open(path).await.map_err(db_err)?;

        conn.call(|conn| Ok(init_schema(conn)?))
            .await
            .map_err(db_err)?;

        Ok(Self { conn })
    }
}

fn db_err(e: tokio_rusqlite::Error) -> QueueError {
    QueueError::Database(e.to_string())
}

/// Fixed-width RFC 3339, so text order equals time order. Only holds for
/// four-digit years, which `NewTask::validate` enforces on insert.
fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn decode_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| decode_time(idx, &t)).transpose()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let created: String = row.get(1)?;
    Ok(Task {
        id: row.get(0)?,
        created_at: decode_time(1, &created)?,
        task_type: row.get(2)?,
        object_id: row.get(3)?,
        done: row.get(4)?,
        failed: row.get(5)?,
        context: row.get(6)?,
        result: row.get(7)?,
        start_time: decode_opt_time(row, 8)?,
        exec_time: decode_opt_time(row, 9)?,
        end_time: decode_opt_time(row, 10)?,
        claimed_by: row.get(11)?,
    })
}

/// Translate a patch into `column = ?n` assignments and their values.
fn patch_assignments(patch: &TaskPatch) -> (Vec<&'static str>, Vec<Value>) {
    let mut columns = Vec::new();
    let mut values = Vec::new();

    if let Some(done) = patch.done {
        columns.push("done");
        values.push(Value::Integer(done as i64));
    }
    if let Some(failed) = patch.failed {
        columns.push("failed");
        values.push(Value::Integer(failed as i64));
    }
    if let Some(result) = &patch.result {
        columns.push("result");
        values.push(Value::Text(result.clone()));
    }
    if let Some(exec_time) = &patch.exec_time {
        columns.push("exec_time");
        values.push(Value::Text(encode_time(exec_time)));
    }
    if let Some(end_time) = &patch.end_time {
        columns.push("end_time");
        values.push(Value::Text(encode_time(end_time)));
    }
    if let Some(claimed_by) = &patch.claimed_by {
        columns.push("claimed_by");
        values.push(match claimed_by {
            Some(worker) => Value::Text(worker.clone()),
            None => Value::Null,
        });
    }

    (columns, values)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn migrate(&self) -> Result<(), QueueError> {
        self.conn
            .call(|conn| Ok(init_schema(conn)?))
            .await
            .map_err(db_err)
    }

    async fn insert(&self, task: NewTask) -> Result<Task, QueueError> {
        task.validate()?;
        let created = encode_time(&task.created_at);
        let start = task.start_time.as_ref().map(encode_time);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO tasks (created_at, task_type, object_id, done, failed, context, result, start_time)
                     VALUES (?1, ?2, ?3, 0, 0, ?4, '', ?5)",
                    params![created, task.task_type, task.object_id, task.context, start],
                )?;
                let id = tx.last_insert_rowid();
                let stored = tx.query_row(
                    &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
                    [id],
                    row_to_task,
                )?;
                tx.commit()?;
                Ok(stored)
            })
            .await
            .map_err(db_err)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        self.conn
            .call(move |conn| {
                let task = conn
                    .query_row(
                        &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
                        [id],
                        row_to_task,
                    )
                    .optional()?;
                Ok(task)
            })
            .await
            .map_err(db_err)
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let limit = limit as i64;
        self.conn
            .call(move |conn| {
                // NULL sorts first in ascending order: immediate rows lead.
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tasks
                     WHERE done = 0 AND claimed_by IS NULL
                     ORDER BY start_time ASC, id ASC
                     LIMIT ?1",
                    COLUMNS
                ))?;
                let tasks = stmt
                    .query_map([limit], row_to_task)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tasks)
            })
            .await
            .map_err(db_err)
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, QueueError> {
        let (columns, mut values) = patch_assignments(patch);

        self.conn
            .call(move |conn| {
                if columns.is_empty() {
                    let exists = conn
                        .prepare("SELECT 1 FROM tasks WHERE id = ?1")?
                        .exists([id])?;
                    return Ok(exists);
                }

                let assignments: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| format!("{} = ?{}", column, i + 1))
                    .collect();
                let sql = format!(
                    "UPDATE tasks SET {} WHERE id = ?{}",
                    assignments.join(", "),
                    columns.len() + 1
                );
                values.push(Value::Integer(id));

                let affected = conn.execute(&sql, params_from_iter(values.iter()))?;
                Ok(affected > 0)
            })
            .await
            .map_err(db_err)
    }

    async fn cancel_pending(&self, object_id: ObjectId) -> Result<u64, QueueError> {
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE tasks SET done = 1 WHERE object_id = ?1 AND done = 0",
                    [object_id],
                )?;
                Ok(affected as u64)
            })
            .await
            .map_err(db_err)
    }

    async fn delete_succeeded(&self, limit: usize) -> Result<u64, QueueError> {
        let limit = limit as i64;
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM tasks WHERE id IN (
                         SELECT id FROM tasks
                         WHERE done = 1 AND failed = 0
                         ORDER BY created_at ASC, id ASC
                         LIMIT ?1
                     )",
                    [limit],
                )?;
                Ok(affected as u64)
            })
            .await
            .map_err(db_err)
    }

    async fn claim(&self, id: TaskId, worker: &str) -> Result<bool, QueueError> {
        let worker = worker.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE tasks SET claimed_by = ?1
                     WHERE id = ?2 AND done = 0 AND claimed_by IS NULL",
                    params![worker, id],
                )?;
                Ok(affected == 1)
            })
            .await
            .map_err(db_err)
    }

    async fn release_claims(&self, worker: &str) -> Result<u64, QueueError> {
        let worker = worker.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE tasks SET claimed_by = NULL WHERE claimed_by = ?1 AND done = 0",
                    [worker],
                )?;
                Ok(affected as u64)
            })
            .await
            .map_err(db_err)
    }

    async fn counts(&self) -> Result<TaskCounts, QueueError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT done, failed, exec_time IS NOT NULL, COUNT(*)
                     FROM tasks GROUP BY 1, 2, 3",
                )?;
                let mut counts = TaskCounts::default();
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?;
                for row in rows {
                    let (done, failed, executed, n) = row?;
                    counts.add_many(TaskStatus::from_flags(done, failed, executed), n as u64);
                }
                Ok(counts)
            })
            .await
            .map_err(db_err)
    }
}
