//! `deferq run`: host a worker until a shutdown signal arrives.

use std::path::Path;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use deferq_config::Config;
use deferq_workqueue::{TaskManager, TaskStore, TidyupConfig, Worker};

use crate::handlers::{EchoHandler, LogHandler};
use crate::open_store;

/// Run a worker and the periodic tidy-up in the foreground.
pub(crate) async fn run_worker(
    config: Config,
    db_path: &Path,
    name: Option<String>,
) -> anyhow::Result<()> {
    info!("Starting deferq v{}", env!("CARGO_PKG_VERSION"));
    info!("Task database: {}", db_path.display());

    let store: Arc<dyn TaskStore> = open_store(db_path).await?;
    let manager = TaskManager::new(store.clone()).await?;

    let mut worker_config = config.worker.clone();
    if let Some(name) = name {
        worker_config.name = name;
    }
    let worker = Arc::new(Worker::new(store, worker_config)?);
    worker.register("echo", Arc::new(EchoHandler));
    worker.register("log", Arc::new(LogHandler));
    info!(
        "Worker '{}' handling: {}",
        worker.name(),
        worker.handlers().task_types().join(", ")
    );

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));
    let tidyup = tokio::spawn(tidyup_loop(manager, config.tidyup.clone(), shutdown.clone()));

    let handle = worker.clone().start_with_token(shutdown.clone());
    handle.join().await?;

    shutdown.cancel();
    tidyup.await?;
    signals.abort();

    info!(
        "deferq stopped ({} succeeded, {} failed, {} poll errors)",
        worker.stats().succeeded(),
        worker.stats().failed(),
        worker.stats().poll_errors()
    );
    Ok(())
}

/// Delete finished rows every `interval_secs` until shutdown.
async fn tidyup_loop(manager: TaskManager, config: TidyupConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Tidy-up loop stopped");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = manager.tidyup(config.max_count).await {
                    error!("Tidy-up failed: {}", e);
                }
            }
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C");
    }

    info!("Shutting down, waiting for in-flight tasks");
    shutdown.cancel();
}
