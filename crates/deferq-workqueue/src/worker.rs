//! Polling worker: claims ready tasks, dispatches them by type and records
//! the outcome.
//!
//! Each handler runs in its own spawned task, so a panic or a missed deadline
//! becomes a failed row instead of taking down the poll loop. Within one
//! batch up to `max_concurrent` handlers run at once.
//!
//! Rows are claimed with a conditional update before dispatch, which keeps two
//! workers sharing a store from running the same row. A claim left behind by a
//! crashed worker is released when a worker with the same name starts again.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::QueueError;
use crate::registry::{HandlerRegistry, TaskHandler};
use crate::store::TaskStore;
use crate::task::{Task, TaskPatch};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Worker counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    polls: AtomicU64,
    poll_errors: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl WorkerStats {
    /// Completed poll cycles.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Poll cycles abandoned on a store error.
    pub fn poll_errors(&self) -> u64 {
        self.poll_errors.load(Ordering::SeqCst)
    }

    /// Tasks recorded as succeeded.
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Tasks recorded as failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Rows returned by the store.
    pub fetched: usize,
    /// Rows whose start time is still in the future.
    pub deferred: usize,
    /// Rows another worker claimed first.
    pub skipped: usize,
    /// Rows handed to a handler (or recorded as unknown type).
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Everything a single dispatch needs, cheap to clone into a spawned task.
#[derive(Clone)]
struct Dispatcher {
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    stats: Arc<WorkerStats>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    /// Run one task and write its outcome. Returns true if it failed.
    async fn dispatch(self, task: Task) -> bool {
        let exec_time = Utc::now();

        let (result, failed) = match self.handlers.get(&task.task_type) {
            Some(handler) => self.invoke(handler, &task).await,
            None => {
                warn!("Unknown task type '{}' for task {}", task.task_type, task.id);
                (format!("unknown task type: {}", task.task_type), true)
            }
        };

        let end_time = Utc::now();
        let patch = TaskPatch::completed(exec_time, end_time, result.as_str(), failed);
        match self.store.update(task.id, &patch).await {
            Ok(true) => {}
            Ok(false) => warn!("Task {} vanished before its outcome was recorded", task.id),
            Err(e) => {
                error!("Failed to record outcome of task {}: {}", task.id, e);
                self.release(&task).await;
            }
        }

        if failed {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
            error!(
                "Task {} failed (type: {}): {}",
                task.id, task.task_type, result
            );
        } else {
            self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
            debug!(
                "Task {} completed (type: {}) in {:?}",
                task.id,
                task.task_type,
                (end_time - exec_time).to_std().unwrap_or_default()
            );
        }

        failed
    }

    /// Drop the claim on a row whose outcome could not be written, so a later
    /// poll fetches it again.
    async fn release(&self, task: &Task) {
        let patch = TaskPatch {
            claimed_by: Some(None),
            ..Default::default()
        };
        match self.store.update(task.id, &patch).await {
            Ok(_) => warn!("Released claim on task {}; it will be dispatched again", task.id),
            Err(e) => error!("Failed to release claim on task {}: {}", task.id, e),
        }
    }

    /// Invoke a handler in isolation. Returns the stored result and the failed flag.
    async fn invoke(&self, handler: Arc<dyn TaskHandler>, task: &Task) -> (String, bool) {
        let owned = task.clone();
        let mut join = tokio::spawn(async move { handler.handle(&owned).await });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return (format!("task timed out after {:?}", limit), true);
                }
            },
            None => join.await,
        };

        match joined {
            Ok(Ok(result)) => (result, false),
            Ok(Err(e)) => (format!("{:#}", e), true),
            Err(e) if e.is_panic() => (
                format!("handler panicked: {}", panic_message(e.into_panic())),
                true,
            ),
            Err(e) => (format!("handler aborted: {}", e), true),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Task worker.
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    /// Create a worker over `store`.
    pub fn new(store: Arc<dyn TaskStore>, config: WorkerConfig) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            store,
            handlers: Arc::new(HandlerRegistry::new()),
            stats: Arc::new(WorkerStats::default()),
        })
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Worker counters.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Register a handler for `task_type`, replacing any previous one.
    pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.register(task_type, handler);
    }

    /// Register an async closure for `task_type`.
    pub fn register_fn<F, Fut>(&self, task_type: impl Into<String>, f: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        self.handlers.register_fn(task_type, f);
    }

    /// Spawn the poll loop.
    pub fn start(self: Arc<Self>) -> WorkerHandle {
        self.start_with_token(CancellationToken::new())
    }

    /// Spawn the poll loop, stopping when `shutdown` is cancelled.
    pub fn start_with_token(self: Arc<Self>, shutdown: CancellationToken) -> WorkerHandle {
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { shutdown, join }
    }

    /// Run the poll loop until `shutdown` is cancelled.
    ///
    /// Store errors abandon the current cycle only; the loop resumes on the
    /// next tick.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        match self.store.release_claims(&self.config.name).await {
            Ok(0) => {}
            Ok(n) => warn!("Worker '{}' released {} stale claims", self.config.name, n),
            Err(e) => error!("Worker '{}' failed to release stale claims: {}", self.config.name, e),
        }

        info!(
            "Worker '{}' started (interval: {:?}, batch: {}, concurrency: {})",
            self.config.name,
            self.config.pull_interval(),
            self.config.pull_task_num,
            self.config.max_concurrent
        );

        let mut ticker = tokio::time::interval(self.config.pull_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_cycle(&shutdown).await {
                        self.stats.poll_errors.fetch_add(1, Ordering::SeqCst);
                        error!("Worker '{}' poll failed: {}", self.config.name, e);
                    }
                }
            }
        }

        info!("Worker '{}' stopped", self.config.name);
    }

    /// Run a single poll cycle.
    pub async fn poll_once(&self) -> Result<PollReport, QueueError> {
        self.poll_cycle(&CancellationToken::new()).await
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            stats: self.stats.clone(),
            timeout: self.config.task_timeout(),
        }
    }

    async fn poll_cycle(&self, shutdown: &CancellationToken) -> Result<PollReport, QueueError> {
        let tasks = self.store.fetch_pending(self.config.pull_task_num).await?;
        self.stats.polls.fetch_add(1, Ordering::SeqCst);

        let now = Utc::now();
        let mut report = PollReport {
            fetched: tasks.len(),
            ..Default::default()
        };
        let mut running = JoinSet::new();
        let mut cycle_error = None;

        for task in tasks {
            if shutdown.is_cancelled() {
                debug!("Worker '{}' stopping mid-batch", self.config.name);
                break;
            }
            if !task.is_eligible_at(now) {
                report.deferred += 1;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        cycle_error = Some(QueueError::Custom(e.to_string()));
                        break;
                    }
                },
            };

            match self.store.claim(task.id, &self.config.name).await {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    cycle_error = Some(e);
                    break;
                }
            }

            report.dispatched += 1;
            let dispatcher = self.dispatcher();
            running.spawn(async move {
                let _permit = permit;
                dispatcher.dispatch(task).await
            });
        }

        // In-flight handlers always run to completion, even after an error or shutdown.
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(true) => report.failed += 1,
                Ok(false) => report.succeeded += 1,
                Err(e) => error!("Dispatch task crashed: {}", e),
            }
        }

        match cycle_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Handle to a running worker loop.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request a clean stop: no new dispatches, in-flight tasks finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops the loop when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check if the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to exit.
    pub async fn join(self) -> Result<(), QueueError> {
        self.join
            .await
            .map_err(|e| QueueError::Custom(format!("worker loop crashed: {}", e)))
    }

    /// Request shutdown and wait for the loop to exit.
    pub async fn stop(self) -> Result<(), QueueError> {
        self.shutdown();
        self.join().await
    }
}
