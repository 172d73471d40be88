use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use trialsync_core::SyncPriority;

#[derive(Parser)]
#[command(name = "trialsync")]
#[command(about = "Inspect and sync a device's offline clinical-trial store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the local store (overrides TRIALSYNC_DEVICE_DB)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Remote document store base URL (overrides TRIALSYNC_REMOTE_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub remote_url: Option<String>,

    /// JSON engine configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a temporary id for a new entity
    NewId {
        /// Id prefix (defaults to "patient")
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Print this store's device id
    DeviceId,
    /// Record a local change and queue it for sync
    Save {
        /// Entity id
        id: String,
        /// Entity type / remote collection
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: String,
        /// Sync priority
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
        /// Read the full entity from a JSON file
        #[arg(long, value_name = "PATH", conflicts_with = "set")]
        file: Option<PathBuf>,
        /// Set one field: `path=json` (dot paths, e.g. baseline.hba1c=7.2)
        #[arg(long, value_name = "PATH=JSON", required_unless_present = "file")]
        set: Vec<String>,
    },
    /// Print an entity from the local store
    Show {
        /// Entity id
        id: String,
        /// Entity type
        #[arg(long = "type", value_name = "TYPE")]
        entity_type: String,
    },
    /// List queued changes in transmission order
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Transmit every queued change to the remote store
    Sync {
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recorded sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check remote reachability and connection quality
    Status,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum PriorityArg {
    Critical,
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for SyncPriority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Critical => Self::Critical,
            PriorityArg::High => Self::High,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::Low => Self::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
