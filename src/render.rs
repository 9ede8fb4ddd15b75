use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde_json::{json, Value};

use crate::backup::BackupEntry;
use crate::lock::{LockOwner, LockStatus};
use crate::store::StatusCounts;
use crate::task_types::{Task, TaskStatus};
use crate::transfer::{ImportMode, ImportSummary};

const DESCRIPTION_WIDTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub(crate) enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn pretty(value: &Value) -> String {
    // Serializing a `Value` cannot fail.
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Text for humans, or the JSON document for scripts.
pub(crate) fn either(format: OutputFormat, text: impl FnOnce() -> String, value: Value) -> String {
    match format {
        OutputFormat::Text => text(),
        OutputFormat::Json => pretty(&value),
    }
}

fn truncate(text: &str, width: usize) -> String {
    let single_line = text.replace(['\r', '\n'], " ");
    if single_line.chars().count() <= width {
        return single_line;
    }
    let kept: String = single_line.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

pub(crate) fn task_list(tasks: &[&Task], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return pretty(&json!(tasks));
    }
    if tasks.is_empty() {
        return "No tasks.".to_string();
    }

    let header = ["ID", "STATUS", "PRI", "TYPE", "CREATED", "DESCRIPTION"];
    let rows: Vec<[String; 6]> = tasks
        .iter()
        .map(|task| {
            [
                task.id.to_string(),
                task.status.to_string(),
                task.priority.to_string(),
                task.task_type.to_string(),
                timestamp(task.created_at),
                truncate(task.description().unwrap_or(""), DESCRIPTION_WIDTH),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let format_row = |cells: Vec<&str>| {
        let mut line = String::new();
        for (column, cell) in cells.iter().enumerate() {
            if column + 1 == cells.len() {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{:<width$}  ", cell, width = widths[column]));
            }
        }
        line.trim_end().to_string()
    };

    let mut lines = vec![format_row(header.to_vec())];
    for row in &rows {
        lines.push(format_row(row.iter().map(String::as_str).collect()));
    }
    lines.join("\n")
}

pub(crate) fn task_detail(task: &Task, format: OutputFormat) -> String {
    either(
        format,
        || {
            let mut lines = vec![
                format!("ID:          {}", task.id),
                format!("Type:        {}", task.task_type),
                format!("Status:      {}", task.status),
                format!("Priority:    {}", task.priority),
                format!("Retries:     {}", task.retry_count),
                format!("Created:     {}", timestamp(task.created_at)),
                format!("Updated:     {}", timestamp(task.updated_at)),
            ];
            if let Some(description) = task.description() {
                lines.push(format!("Description: {}", description));
            }
            if let Some(marker) = task.completion_marker() {
                lines.push(format!("Completion marker:  {}", marker));
            }
            if let Some(pattern) = task.completion_pattern() {
                lines.push(format!("Completion pattern: {}", pattern));
            }
            if let Some(timeout) = task.timeout_secs() {
                lines.push(format!("Timeout:     {}s", timeout));
            }
            if task.clear_context() {
                lines.push("Clear context: yes".to_string());
            }
            if !task.metadata.is_empty() {
                lines.push("Metadata:".to_string());
                for (key, value) in &task.metadata {
                    let shown = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    lines.push(format!("  {} = {}", key, shown));
                }
            }
            lines.join("\n")
        },
        json!(task),
    )
}

pub(crate) fn stats(counts: &StatusCounts, format: OutputFormat) -> String {
    either(
        format,
        || {
            let mut lines: Vec<String> = TaskStatus::ALL
                .iter()
                .map(|status| format!("{:<12} {}", status.as_str(), counts.get(*status)))
                .collect();
            lines.push(format!("{:<12} {}", "total", counts.total()));
            lines.join("\n")
        },
        json!({ "total": counts.total(), "counts": counts }),
    )
}

fn owner_json(owner: Option<&LockOwner>) -> Value {
    match owner {
        Some(owner) => json!(owner),
        None => Value::Null,
    }
}

fn owner_text(owner: Option<&LockOwner>) -> String {
    match owner {
        Some(owner) => format!(
            "pid {} on {} since {}",
            owner.pid,
            owner.hostname,
            timestamp(owner.acquired_at)
        ),
        None => "unknown holder".to_string(),
    }
}

pub(crate) fn lock_status(status: &LockStatus, marker: &str, format: OutputFormat) -> String {
    let (state, owner, reason) = match status {
        LockStatus::Unlocked => ("unlocked", None, None),
        LockStatus::Held { owner } => ("held", owner.as_ref(), None),
        LockStatus::Stale { owner, reason } => ("stale", owner.as_ref(), Some(reason.as_str())),
    };
    either(
        format,
        || match status {
            LockStatus::Unlocked => format!("Lock {}: unlocked", marker),
            LockStatus::Held { .. } => format!("Lock {}: held by {}", marker, owner_text(owner)),
            LockStatus::Stale { .. } => format!(
                "Lock {}: stale, held by {} ({})",
                marker,
                owner_text(owner),
                reason.unwrap_or("")
            ),
        },
        json!({
            "path": marker,
            "state": state,
            "owner": owner_json(owner),
            "reason": reason,
        }),
    )
}

pub(crate) fn import_summary(summary: &ImportSummary, mode: ImportMode, format: OutputFormat) -> String {
    either(
        format,
        || {
            let verb = if mode == ImportMode::Validate {
                "Validated"
            } else {
                "Imported"
            };
            let mut lines = vec![format!(
                "{} {} tasks ({}): {} inserted, {} updated, {} failed",
                verb,
                summary.total,
                mode.as_str(),
                summary.inserted,
                summary.updated,
                summary.failed
            )];
            if let Some(snapshot) = &summary.snapshot {
                lines.push(format!("Previous queue saved to {}", snapshot.path.display()));
            }
            lines.extend(summary.errors.iter().map(|error| format!("  {}", error)));
            lines.join("\n")
        },
        json!({
            "mode": mode.as_str(),
            "summary": summary,
            "snapshot": summary.snapshot.as_ref().map(|entry| entry.path.display().to_string()),
        }),
    )
}

fn backup_json(entry: &BackupEntry) -> Value {
    json!({
        "path": entry.path.display().to_string(),
        "taken_at": timestamp(entry.taken_at),
        "reason": entry.reason,
        "size": entry.size,
    })
}

pub(crate) fn backup_entry(entry: &BackupEntry, verb: &str, format: OutputFormat) -> String {
    either(
        format,
        || format!("{} {}", verb, entry.path.display()),
        backup_json(entry),
    )
}

pub(crate) fn backup_list(entries: &[BackupEntry], format: OutputFormat) -> String {
    either(
        format,
        || {
            if entries.is_empty() {
                return "No backups.".to_string();
            }
            entries
                .iter()
                .map(|entry| {
                    format!(
                        "{}  {:<12} {:>8}  {}",
                        timestamp(entry.taken_at),
                        entry.reason,
                        entry.size,
                        entry.path.display()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        },
        Value::Array(entries.iter().map(backup_json).collect()),
    )
}

pub(crate) fn error(kind: &str, message: &str) -> String {
    json!({ "error": { "kind": kind, "message": message } }).to_string()
}
