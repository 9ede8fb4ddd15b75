use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::task_types::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub(crate) enum QueueError {
    #[error("{0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid transition for task {id}: {from} -> {to}{}", reason_suffix(.reason))]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
    },

    #[error("Queue is full (max_queue_size={max})")]
    QueueFull { max: usize },

    #[error("Timed out after {}ms waiting for lock {}", .waited.as_millis(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Corrupt store {}: {detail}", .path.display())]
    CorruptStore { path: PathBuf, detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Interrupted while waiting for lock {}", .path.display())]
    Interrupted { path: PathBuf },
}

impl QueueError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable name for structured error output.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::QueueFull { .. } => "queue_full",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::CorruptStore { .. } => "corrupt_store",
            Self::Io { .. } => "io",
            Self::Interrupted { .. } => "interrupted",
        }
    }

    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 1,
            Self::NotFound(_) => 3,
            Self::InvalidTransition { .. } => 4,
            Self::QueueFull { .. } => 5,
            Self::LockTimeout { .. } => 6,
            Self::CorruptStore { .. } => 7,
            Self::Io { .. } => 8,
            Self::Interrupted { .. } => 130,
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|reason| format!(" ({reason})"))
        .unwrap_or_default()
}

pub(crate) type QueueResult<T> = Result<T, QueueError>;
