//! CLI definitions for deferq.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// deferq CLI.
#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "Persistent delayed task queue")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (defaults to ~/.deferq/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Task database path (overrides [database] path)
    #[arg(long, env = "DEFERQ_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run a worker in the foreground (default)
    Run {
        /// Worker name (overrides [worker] name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Enqueue a task
    Enqueue {
        /// Object ID the task concerns
        object_id: i64,

        /// Task type (handler selector)
        task_type: String,

        /// Opaque payload handed to the handler
        #[arg(long, default_value = "")]
        context: String,

        /// Delay before the task becomes eligible, in seconds
        #[arg(long, default_value_t = 0)]
        delay_secs: u64,
    },

    /// Cancel all pending tasks of an object
    Cancel {
        /// Object ID
        object_id: i64,
    },

    /// Delete succeeded and cancelled tasks
    Tidyup {
        /// Maximum rows to delete (overrides [tidyup] max_count)
        #[arg(long)]
        max_count: Option<usize>,
    },

    /// Show row counts per status
    Stats {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show one task
    Show {
        /// Task ID
        id: i64,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}
