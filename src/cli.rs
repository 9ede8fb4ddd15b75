use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::filter::SortKey;
use crate::render::OutputFormat;
use crate::transfer::{ExportFormat, ImportMode};

#[derive(Debug, Parser)]
#[command(
    name = "taskq",
    about = "Persistent, lock-protected task queue.",
    long_about = "taskq keeps a priority queue of tasks in a single JSON store, serializes writers with a lock, and snapshots the store before every change.\n\nRead-only commands (show, list, stats, export, next without --claim) never wait for the lock.",
    disable_help_subcommand = true
)]
pub(crate) struct Cli {
    /// Load configuration from PATH instead of ~/.config/taskq.yml.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        help = "Load configuration from PATH instead of ~/.config/taskq.yml."
    )]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        long = "queue-dir",
        global = true,
        env = "TASKQ_DIR",
        value_name = "DIR",
        help = "Queue directory holding tasks.json and backups/ (default ~/.taskq)."
    )]
    pub(crate) queue_dir: Option<PathBuf>,

    #[arg(
        long = "format",
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format."
    )]
    pub(crate) format: OutputFormat,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Add a pending task and print its id.
    Create(CreateArgs),
    /// Delete a task in any status.
    Remove {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Move a task along its lifecycle (e.g. pending -> in_progress).
    UpdateStatus {
        #[arg(value_name = "ID")]
        id: String,
        #[arg(value_name = "STATUS")]
        status: String,
    },
    /// Change a task's priority (1-10).
    UpdatePriority {
        #[arg(value_name = "ID")]
        id: String,
        #[arg(value_name = "PRIORITY", allow_negative_numbers = true)]
        priority: String,
    },
    /// Print the id of the next pending task, if any.
    Next {
        /// Also mark it in_progress.
        #[arg(long)]
        claim: bool,
    },
    /// Show one task, including completion marker, pattern and timeout.
    Show {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// List tasks matching the given filters.
    List(ListArgs),
    /// Count tasks per status.
    Stats,
    /// Write tasks as JSON or CSV.
    Export(ExportArgs),
    /// Load tasks from an export or store document (PATH or - for stdin).
    Import {
        #[arg(value_name = "PATH")]
        source: String,
        #[arg(long, value_enum, default_value_t = ImportMode::Merge)]
        mode: ImportMode,
    },
    /// Remove completed, failed and timed-out tasks older than the retention window.
    Cleanup {
        #[arg(long = "max-age-days", value_name = "DAYS", allow_negative_numbers = true)]
        max_age_days: Option<i64>,
    },
    /// Manage store snapshots.
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },
    /// Inspect or clear the store lock.
    Lock {
        #[command(subcommand)]
        action: LockCommand,
    },
}

#[derive(Debug, Args)]
pub(crate) struct CreateArgs {
    #[arg(long = "type", value_name = "TYPE", default_value = "custom")]
    pub(crate) task_type: String,

    /// Defaults to `default_priority` from the config.
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub(crate) priority: Option<String>,

    #[arg(long, value_name = "ID")]
    pub(crate) id: Option<String>,

    #[arg(long)]
    pub(crate) description: Option<String>,

    /// Command text for custom tasks.
    #[arg(long)]
    pub(crate) command: Option<String>,

    #[arg(long = "completion-marker", value_name = "TEXT")]
    pub(crate) completion_marker: Option<String>,

    #[arg(long = "completion-pattern", value_name = "REGEX")]
    pub(crate) completion_pattern: Option<String>,

    /// Execution timeout in seconds, enforced by the caller.
    #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
    pub(crate) timeout: Option<String>,

    #[arg(long = "clear-context")]
    pub(crate) clear_context: bool,

    /// Extra metadata (repeatable).
    #[arg(long = "meta", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
    pub(crate) meta: Vec<String>,
}

#[derive(Debug, Args, Default)]
pub(crate) struct FilterArgs {
    /// Status or comma-separated set (repeatable).
    #[arg(long, value_name = "STATUS", action = clap::ArgAction::Append)]
    pub(crate) status: Vec<String>,

    /// Exact priority `N` or inclusive range `A-B`.
    #[arg(long, value_name = "N|A-B")]
    pub(crate) priority: Option<String>,

    #[arg(long = "type", value_name = "TYPE")]
    pub(crate) task_type: Option<String>,

    /// Created at or after (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_name = "TIME")]
    pub(crate) after: Option<String>,

    /// Created at or before (RFC 3339 or YYYY-MM-DD).
    #[arg(long, value_name = "TIME")]
    pub(crate) before: Option<String>,

    /// Case-insensitive text searched in metadata keys and values.
    #[arg(long, value_name = "TEXT")]
    pub(crate) search: Option<String>,
}

#[derive(Debug, Args)]
pub(crate) struct ListArgs {
    #[command(flatten)]
    pub(crate) filter: FilterArgs,

    #[arg(long, value_enum, default_value_t = SortKey::Priority)]
    pub(crate) sort: SortKey,

    #[arg(long, value_name = "N")]
    pub(crate) limit: Option<usize>,
}

#[derive(Debug, Args)]
pub(crate) struct ExportArgs {
    #[command(flatten)]
    pub(crate) filter: FilterArgs,

    #[arg(long = "export-format", value_enum, default_value_t = ExportFormat::Json)]
    pub(crate) export_format: ExportFormat,

    /// Write to PATH instead of stdout.
    #[arg(short = 'o', long, value_name = "PATH")]
    pub(crate) output: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum BackupCommand {
    /// Snapshot the store now.
    Create {
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// List snapshots, newest first.
    List,
    /// Show the newest snapshot.
    Latest,
    /// Delete snapshots older than the retention window.
    Cleanup {
        #[arg(long = "retention-days", value_name = "DAYS", allow_negative_numbers = true)]
        retention_days: Option<i64>,
    },
    /// Replace the store with a snapshot (PATH or `latest`).
    Restore {
        #[arg(value_name = "PATH|latest")]
        source: String,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum LockCommand {
    /// Report whether the lock is held, and by whom.
    Status,
    /// Remove the lock only if its holder is gone or it is too old.
    Cleanup,
    /// Remove the lock unconditionally. Unsafe while another taskq is running.
    ForceUnlock,
}

/// Splits repeatable, comma-separated flag values into single items.
pub(crate) fn split_comma_values(raw_values: &[String], flag: &str) -> Result<Vec<String>, String> {
    let mut values = Vec::new();
    for raw in raw_values {
        for (index, segment) in raw.split(',').enumerate() {
            let trimmed = segment.trim();
            if trimmed.is_empty() {
                return Err(format!(
                    "Invalid {} value: empty segment in {:?} at index {}.",
                    flag, raw, index
                ));
            }
            values.push(trimmed.to_string());
        }
    }
    Ok(values)
}
