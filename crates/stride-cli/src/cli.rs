use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "stride", about = "Offline-first Stride tracker CLI")]
pub struct Cli {
    /// Data directory holding the durable cache.
    #[arg(long, default_value = ".stride")]
    pub root: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Hydrate from the cache and reconcile with the remote store.
    Refresh,
    /// Engine diagnostics as JSON.
    Status,
    /// Task collection operations.
    Task(TaskArgs),
    /// Goal collection operations.
    Goal(GoalArgs),
    /// Pending-mutation queue operations.
    Queue(QueueArgs),
    /// Clear local state and quick-access snapshots for the signed-in user.
    SignOut,
}

#[derive(Debug, Args)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommand,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    List,
    Add {
        id: String,
        title: String,
        #[arg(long)]
        notes: Option<String>,
        /// Also record the intent in the pending-mutation queue.
        #[arg(long, default_value_t = false)]
        queued: bool,
    },
    Done {
        id: String,
    },
    Rm {
        id: String,
    },
}

#[derive(Debug, Args)]
pub struct GoalArgs {
    #[command(subcommand)]
    pub command: GoalCommand,
}

#[derive(Debug, Subcommand)]
pub enum GoalCommand {
    List,
    Add {
        id: String,
        title: String,
        #[arg(long)]
        notes: Option<String>,
    },
    Progress {
        id: String,
        percent: u8,
    },
    Rm {
        id: String,
    },
}

#[derive(Debug, Args)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub command: QueueCommand,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    List,
    Clear,
}
