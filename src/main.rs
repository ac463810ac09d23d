//! deferq - Persistent delayed task queue
//!
//! Main entry point for the deferq CLI and worker host.

mod cli;
mod cmd_admin;
mod cmd_run;
mod handlers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::debug;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use deferq_config::{deferq_dir, Config, ConfigLoader};
use deferq_store_sqlite::SqliteTaskStore;
use deferq_workqueue::{TaskManager, TaskStore};

use crate::cli::{Cli, Commands};

/// Initialize tracing with console output and, when `log_dir` is set, a
/// daily rolling log file.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("deferq")
                .filename_suffix("log")
                .max_log_files(30)
                .build(dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Keep the writer flushing for the program duration.
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false).boxed())
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(file_layer)
        .init();

    Ok(())
}

/// Load the config file. An explicit path must exist; the default one may not.
fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => ConfigLoader::load(path)?,
        None => ConfigLoader::load_or_default(&deferq_dir().join("config.toml"))?,
    };
    Ok(config)
}

/// Open the SQLite store, creating the parent directory if needed.
pub(crate) async fn open_store(path: &Path) -> anyhow::Result<Arc<dyn TaskStore>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let store = SqliteTaskStore::open(path).await?;
    Ok(Arc::new(store))
}

async fn open_manager(path: &Path) -> anyhow::Result<TaskManager> {
    Ok(TaskManager::new(open_store(path).await?).await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(config.logging.resolved_dir().as_deref())?;

    let db_path: PathBuf = cli
        .db
        .clone()
        .unwrap_or_else(|| config.database.resolved_path());
    debug!("Using task database {}", db_path.display());

    match cli.command.unwrap_or(Commands::Run { name: None }) {
        Commands::Run { name } => cmd_run::run_worker(config, &db_path, name).await,
        Commands::Enqueue {
            object_id,
            task_type,
            context,
            delay_secs,
        } => {
            let manager = open_manager(&db_path).await?;
            cmd_admin::enqueue(&manager, object_id, &task_type, &context, delay_secs).await
        }
        Commands::Cancel { object_id } => {
            let manager = open_manager(&db_path).await?;
            cmd_admin::cancel(&manager, object_id).await
        }
        Commands::Tidyup { max_count } => {
            let manager = open_manager(&db_path).await?;
            let max_count = max_count.unwrap_or(config.tidyup.max_count);
            cmd_admin::tidyup(&manager, max_count).await
        }
        Commands::Stats { format } => {
            let manager = open_manager(&db_path).await?;
            cmd_admin::stats(&manager, &format).await
        }
        Commands::Show { id, format } => {
            let manager = open_manager(&db_path).await?;
            cmd_admin::show(&manager, id, &format).await
        }
    }
}
