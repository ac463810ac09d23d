use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::sync::Barrier;

use crate::store::MemoryTaskStore;
use crate::task::{NewTask, ObjectId, TaskCounts, TaskId, TaskStatus};

fn test_config(name: &str) -> WorkerConfig {
    WorkerConfig::named(name).with_pull_interval(Duration::from_millis(20))
}

fn new_worker(store: Arc<MemoryTaskStore>) -> Arc<Worker> {
    Arc::new(Worker::new(store, test_config("test-worker")).unwrap())
}

async fn enqueue(store: &MemoryTaskStore, task_type: &str) -> TaskId {
    store
        .insert(NewTask::new(1, task_type, "{}"))
        .await
        .unwrap()
        .id
}

async fn wait_done(store: &dyn TaskStore, id: TaskId) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = store.get(id).await.unwrap().unwrap();
        if task.done {
            return task;
        }
        assert!(tokio::time::Instant::now() < deadline, "task {} never finished", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn counting_handler(worker: &Worker, task_type: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    worker.register_fn(task_type, move |_task: Task| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        }
    });
    calls
}

#[test]
fn test_worker_rejects_invalid_config() {
    let store = Arc::new(MemoryTaskStore::new());
    let config = WorkerConfig::default().with_max_concurrent(0);
    assert!(matches!(
        Worker::new(store, config),
        Err(QueueError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_success_records_outcome() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = new_worker(store.clone());
    worker.register_fn("echo", |task: Task| async move { Ok(format!("got {}", task.context)) });

    let before = Utc::now();
    let id = enqueue(&store, "echo").await;
    let report = worker.poll_once().await.unwrap();
    let after = Utc::now();

    assert_eq!(report.fetched, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.succeeded, 1);

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.done);
    assert!(!task.failed);
    assert_eq!(task.result, "got {}");
    let exec = task.exec_time.unwrap();
    let end = task.end_time.unwrap();
    assert!(exec >= before && exec <= after);
    assert!(end >= exec);
    assert_eq!(task.claimed_by.as_deref(), Some("test-worker"));
    assert_eq!(task.status(), TaskStatus::Succeeded);
    assert_eq!(worker.stats().succeeded(), 1);
}

#[tokio::test]
async fn test_handler_error_is_recorded() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = new_worker(store.clone());
    worker.register_fn("hello", |_task: Task| async move {
        Err(anyhow::anyhow!("mock fail"))
    });

    let id = enqueue(&store, "hello").await;
    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.done);
    assert!(task.failed);
    assert!(task.result.contains("mock fail"));
    assert!(task.exec_time.is_some());
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(worker.stats().failed(), 1);
}

#[tokio::test]
async fn test_error_context_chain_is_kept() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = new_worker(store.clone());
    worker.register_fn("io", |_task: Task| async move {
        let err = anyhow::anyhow!("connection refused").context("fetching avatar");
        Err(err)
    });

    let id = enqueue(&store, "io").await;
    worker.poll_once().await.unwrap();

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.result.contains("fetching avatar"));
    assert!(task.result.contains("connection refused"));
}

#[tokio::test]
async fn test_panic_is_isolated() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = Arc::new(
        Worker::new(store.clone(), test_config("w").with_max_concurrent(1)).unwrap(),
    );
    worker.register_fn("boom", |_task: Task| async move {
        if true {
            panic!("handler exploded");
        }
        Ok(String::new())
    });
    let calls = counting_handler(&worker, "fine");

    let boom = enqueue(&store, "boom").await;
    let fine = enqueue(&store, "fine").await;

    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);

    let boom = store.get(boom).await.unwrap().unwrap();
    assert!(boom.done && boom.failed);
    assert!(boom.result.contains("handler exploded"));

    let fine = store.get(fine).await.unwrap().unwrap();
    assert!(fine.done && !fine.failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Later batches still run.
    let later = enqueue(&store, "fine").await;
    worker.poll_once().await.unwrap();
    assert!(store.get(later).await.unwrap().unwrap().done);
}

#[tokio::test]
async fn test_unknown_type_fails_without_invoking_handlers() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = new_worker(store.clone());
    let calls = counting_handler(&worker, "greet");

    let id = enqueue(&store, "unknown").await;
    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.done);
    assert!(task.failed);
    assert_eq!(task.result, "unknown task type: unknown");
    assert!(task.exec_time.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_future_start_time_is_deferred() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = new_worker(store.clone());
    let calls = counting_handler(&worker, "greet");

    let start = Utc::now() + ChronoDuration::milliseconds(300);
    let id = store
        .insert(NewTask::new(1, "greet", "").with_start_time(start))
        .await
        .unwrap()
        .id;

    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.dispatched, 0);
    let task = store.get(id).await.unwrap().unwrap();
    assert!(!task.done);
    assert!(task.claimed_by.is_none());

    tokio::time::sleep(Duration::from_millis(350)).await;
    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.dispatched, 1);

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.done);
    assert!(task.exec_time.unwrap() >= start);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_tasks_are_never_dispatched() {
    let store = Arc::new(MemoryTaskStore::new());
    let manager = crate::TaskManager::new(store.clone()).await.unwrap();
    let worker = new_worker(store.clone());
    let calls = counting_handler(&worker, "greet");

    for _ in 0..3 {
        manager
            .enqueue(9, "greet", "", Duration::ZERO)
            .await
            .unwrap();
    }
    assert_eq!(manager.cancel_all(9).await.unwrap(), 3);

    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.counts().await.unwrap().cancelled, 3);
}

#[tokio::test]
async fn test_timeout_marks_task_failed() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = Arc::new(
        Worker::new(store.clone(), test_config("w").with_task_timeout_secs(1)).unwrap(),
    );
    worker.register_fn("slow", |_task: Task| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".to_string())
    });

    let id = enqueue(&store, "slow").await;
    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.failed);
    assert!(task.result.contains("timed out"));
}

#[tokio::test]
async fn test_batch_runs_concurrently() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = Arc::new(
        Worker::new(store.clone(), test_config("w").with_max_concurrent(4)).unwrap(),
    );
    let barrier = Arc::new(Barrier::new(4));
    let b = barrier.clone();
    worker.register_fn("meet", move |_task: Task| {
        let b = b.clone();
        async move {
            b.wait().await;
            Ok(String::new())
        }
    });

    for _ in 0..4 {
        enqueue(&store, "meet").await;
    }

    // Sequential dispatch would never get past the barrier.
    let report = tokio::time::timeout(Duration::from_secs(2), worker.poll_once())
        .await
        .expect("handlers did not run concurrently")
        .unwrap();
    assert_eq!(report.succeeded, 4);
}

#[tokio::test]
async fn test_batch_size_limits_fetch() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = Arc::new(
        Worker::new(store.clone(), test_config("w").with_pull_task_num(2)).unwrap(),
    );
    counting_handler(&worker, "greet");
    for _ in 0..5 {
        enqueue(&store, "greet").await;
    }

    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(store.counts().await.unwrap().pending, 3);
}

#[tokio::test]
async fn test_two_workers_never_double_dispatch() {
    let store = Arc::new(MemoryTaskStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let make = |name: &str| {
        let worker = Arc::new(Worker::new(store.clone(), test_config(name)).unwrap());
        let counter = calls.clone();
        worker.register_fn("greet", move |_task: Task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(String::new())
            }
        });
        worker
    };
    let a = make("a");
    let b = make("b");

    for _ in 0..10 {
        enqueue(&store, "greet").await;
    }

    let (ra, rb) = tokio::join!(a.poll_once(), b.poll_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.dispatched + rb.dispatched, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_run_loop_and_shutdown() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = new_worker(store.clone());
    counting_handler(&worker, "greet");

    let handle = worker.clone().start();
    let id = enqueue(&store, "greet").await;
    let task = wait_done(store.as_ref(), id).await;
    assert!(!task.failed);

    handle.stop().await.unwrap();
    assert!(worker.stats().polls() > 0);

    // Nothing is dispatched after shutdown.
    let late = enqueue(&store, "greet").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!store.get(late).await.unwrap().unwrap().done);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handler() {
    let store = Arc::new(MemoryTaskStore::new());
    let worker = new_worker(store.clone());
    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();
    worker.register_fn("slow", move |_task: Task| {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok("finished".to_string())
        }
    });

    let id = enqueue(&store, "slow").await;
    let handle = worker.clone().start();
    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    handle.stop().await.unwrap();

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.done);
    assert!(!task.failed);
    assert_eq!(task.result, "finished");
}

#[tokio::test]
async fn test_stale_claims_released_on_start() {
    let store = Arc::new(MemoryTaskStore::new());
    let id = enqueue(&store, "greet").await;
    assert!(store.claim(id, "test-worker").await.unwrap());

    let worker = new_worker(store.clone());
    let calls = counting_handler(&worker, "greet");
    let handle = worker.clone().start();

    wait_done(store.as_ref(), id).await;
    handle.stop().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Store whose first `failures` fetches and first `update_failures` updates fail.
struct FlakyStore {
    inner: MemoryTaskStore,
    failures: AtomicUsize,
    update_failures: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize, update_failures: usize) -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            failures: AtomicUsize::new(failures),
            update_failures: AtomicUsize::new(update_failures),
        }
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn migrate(&self) -> Result<(), QueueError> {
        self.inner.migrate().await
    }

    async fn insert(&self, task: NewTask) -> Result<Task, QueueError> {
        self.inner.insert(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, QueueError> {
        self.inner.get(id).await
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(QueueError::Database("database is locked".to_string()));
        }
        self.inner.fetch_pending(limit).await
    }

    async fn update(&self, id: TaskId, patch: &TaskPatch) -> Result<bool, QueueError> {
        let left = self.update_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.update_failures.store(left - 1, Ordering::SeqCst);
            return Err(QueueError::Database("disk I/O error".to_string()));
        }
        self.inner.update(id, patch).await
    }

    async fn cancel_pending(&self, object_id: ObjectId) -> Result<u64, QueueError> {
        self.inner.cancel_pending(object_id).await
    }

    async fn delete_succeeded(&self, limit: usize) -> Result<u64, QueueError> {
        self.inner.delete_succeeded(limit).await
    }

    async fn claim(&self, id: TaskId, worker: &str) -> Result<bool, QueueError> {
        self.inner.claim(id, worker).await
    }

    async fn release_claims(&self, worker: &str) -> Result<u64, QueueError> {
        self.inner.release_claims(worker).await
    }

    async fn counts(&self) -> Result<TaskCounts, QueueError> {
        self.inner.counts().await
    }
}

#[tokio::test]
async fn test_poll_errors_are_transient() {
    let store = Arc::new(FlakyStore::new(3, 0));
    let worker = Arc::new(Worker::new(store.clone(), test_config("w")).unwrap());
    counting_handler(&worker, "greet");

    let id = store
        .insert(NewTask::new(1, "greet", ""))
        .await
        .unwrap()
        .id;

    assert!(worker.poll_once().await.is_err());

    let handle = worker.clone().start();
    let task = wait_done(store.as_ref(), id).await;
    handle.stop().await.unwrap();

    assert!(!task.failed);
    assert_eq!(worker.stats().poll_errors(), 2);
}

#[tokio::test]
async fn test_failed_outcome_write_releases_claim() {
    let store = Arc::new(FlakyStore::new(0, 1));
    let worker = Arc::new(Worker::new(store.clone(), test_config("w")).unwrap());
    let calls = counting_handler(&worker, "greet");

    let id = store
        .insert(NewTask::new(1, "greet", ""))
        .await
        .unwrap()
        .id;

    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.dispatched, 1);

    let task = store.get(id).await.unwrap().unwrap();
    assert!(!task.done);
    assert!(task.claimed_by.is_none());

    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.fetched, 1);

    let task = store.get(id).await.unwrap().unwrap();
    assert!(task.done);
    assert!(!task.failed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.counts().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_unrepresentable_delay_never_runs() {
    let store = Arc::new(MemoryTaskStore::new());
    let manager = crate::TaskManager::new(store.clone()).await.unwrap();
    let worker = new_worker(store.clone());
    let calls = counting_handler(&worker, "greet");

    let result = manager
        .enqueue(1, "greet", "", Duration::from_secs(u64::MAX))
        .await;
    assert!(result.is_err());

    let report = worker.poll_once().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
