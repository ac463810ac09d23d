//! One-shot queue administration commands.

use std::time::Duration;

use deferq_workqueue::{QueueError, Task, TaskCounts, TaskId, TaskManager};

/// Enqueue a task and print its ID.
pub(crate) async fn enqueue(
    manager: &TaskManager,
    object_id: i64,
    task_type: &str,
    context: &str,
    delay_secs: u64,
) -> anyhow::Result<()> {
    let id = manager
        .enqueue(object_id, task_type, context, Duration::from_secs(delay_secs))
        .await?;
    println!("{}", id);
    Ok(())
}

/// Cancel all pending tasks of an object.
pub(crate) async fn cancel(manager: &TaskManager, object_id: i64) -> anyhow::Result<()> {
    let cancelled = manager.cancel_all(object_id).await?;
    println!("Cancelled {} pending tasks for object {}", cancelled, object_id);
    Ok(())
}

/// Run one tidy-up pass.
pub(crate) async fn tidyup(manager: &TaskManager, max_count: usize) -> anyhow::Result<()> {
    let deleted = manager.tidyup(max_count).await?;
    println!("Deleted {} finished tasks", deleted);
    Ok(())
}

/// Print row counts per status.
pub(crate) async fn stats(manager: &TaskManager, format: &str) -> anyhow::Result<()> {
    let counts = manager.counts().await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&counts)?),
        _ => print!("{}", format_counts(&counts)),
    }
    Ok(())
}

/// Print one task.
pub(crate) async fn show(manager: &TaskManager, id: TaskId, format: &str) -> anyhow::Result<()> {
    let task = manager
        .store()
        .get(id)
        .await?
        .ok_or(QueueError::TaskNotFound(id))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&task)?),
        _ => print!("{}", format_task(&task)),
    }
    Ok(())
}

fn format_counts(counts: &TaskCounts) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<12} {}\n", "STATUS", "COUNT"));
    out.push_str(&format!("{}\n", "-".repeat(20)));
    out.push_str(&format!("{:<12} {}\n", "pending", counts.pending));
    out.push_str(&format!("{:<12} {}\n", "cancelled", counts.cancelled));
    out.push_str(&format!("{:<12} {}\n", "succeeded", counts.succeeded));
    out.push_str(&format!("{:<12} {}\n", "failed", counts.failed));
    out.push_str(&format!("{:<12} {}\n", "total", counts.total()));
    out
}

fn format_task(task: &Task) -> String {
    let time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };

    let mut out = String::new();
    out.push_str(&format!("Task: {}\n", task.id));
    out.push_str(&format!("{}\n", "=".repeat(50)));
    out.push_str(&format!("Type:       {}\n", task.task_type));
    out.push_str(&format!("Object:     {}\n", task.object_id));
    out.push_str(&format!("Status:     {}\n", task.status()));
    out.push_str(&format!("Created:    {}\n", task.created_at.to_rfc3339()));
    out.push_str(&format!("Start:      {}\n", time(task.start_time)));
    out.push_str(&format!("Executed:   {}\n", time(task.exec_time)));
    out.push_str(&format!("Ended:      {}\n", time(task.end_time)));
    if let Some(worker) = &task.claimed_by {
        out.push_str(&format!("Worker:     {}\n", worker));
    }
    if let (Some(exec), Some(end)) = (task.exec_time, task.end_time) {
        out.push_str(&format!(
            "Duration:   {}ms\n",
            (end - exec).num_milliseconds()
        ));
    }
    if !task.context.is_empty() {
        out.push_str(&format!("\nContext:\n  {}\n", task.context));
    }
    if !task.result.is_empty() {
        out.push_str(&format!("\nResult:\n  {}\n", task.result));
    }
    out
}
