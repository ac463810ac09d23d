//! Database schema management.

use rusqlite::Connection;
use std::time::Duration;
use tokio_rusqlite::Error;

/// Name of the task table.
pub const TASKS_TABLE: &str = "tasks";

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    // In-memory databases report "memory" and keep their journal mode.
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

// AUTOINCREMENT keeps ids of tidied-up rows from being reused.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    task_type TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    done INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    context TEXT NOT NULL DEFAULT '',
    result TEXT NOT NULL DEFAULT '',
    start_time TEXT,
    exec_time TEXT,
    end_time TEXT,
    claimed_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_object ON tasks(object_id, done);
CREATE INDEX IF NOT EXISTS idx_tasks_pending ON tasks(done, start_time);
CREATE INDEX IF NOT EXISTS idx_tasks_retention ON tasks(done, failed, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_claimed ON tasks(claimed_by);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")
            .unwrap();
        assert!(stmt.exists([TASKS_TABLE]).unwrap());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (created_at, task_type, object_id) VALUES ('2024-01-01T00:00:00Z', 't', 1)",
            [],
        )
        .unwrap();

        init_schema(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
