use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io;

use crate::backup::{BackupEntry, BackupManager};
use crate::config::PriorityOrder;
use crate::error::{QueueError, QueueResult};
use crate::filter::TaskFilter;
use crate::queue::{QueueEngine, QueuePolicy, Upsert};
use crate::store::{StatusCounts, TaskIndex, STORE_VERSION};
use crate::task_types::{Metadata, Priority, Task, TaskId, TaskStatus, TaskType};

/// Per-task failures beyond this many are counted but not described.
const MAX_REPORTED_ERRORS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub(crate) enum ExportFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub(crate) enum ImportMode {
    /// Check the payload without touching the queue.
    Validate,
    /// Insert new ids, overwrite existing ones.
    #[default]
    Merge,
    /// Snapshot, clear the queue, then merge.
    Replace,
}

impl ImportMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

#[derive(Serialize)]
struct ExportConfig {
    max_queue_size: usize,
    max_retries: u32,
    priority_order: PriorityOrder,
}

#[derive(Serialize)]
struct ExportInfo {
    version: u32,
    exported_at: DateTime<Utc>,
    total_tasks: usize,
    counts: StatusCounts,
    config: ExportConfig,
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    export_info: ExportInfo,
    tasks: Vec<&'a Task>,
}

/// Serializes the tasks matching `filter`, oldest first.
pub(crate) fn export(
    index: &TaskIndex,
    policy: QueuePolicy,
    format: ExportFormat,
    filter: &TaskFilter,
    now: DateTime<Utc>,
) -> QueueResult<Vec<u8>> {
    let tasks: Vec<&Task> = index
        .sorted()
        .into_iter()
        .filter(|task| filter.matches(task))
        .collect();
    match format {
        ExportFormat::Json => export_json(tasks, policy, now),
        ExportFormat::Csv => Ok(export_csv(&tasks).into_bytes()),
    }
}

fn export_json(tasks: Vec<&Task>, policy: QueuePolicy, now: DateTime<Utc>) -> QueueResult<Vec<u8>> {
    let document = ExportDocument {
        export_info: ExportInfo {
            version: STORE_VERSION,
            exported_at: now,
            total_tasks: tasks.len(),
            counts: StatusCounts::of(tasks.iter().copied()),
            config: ExportConfig {
                max_queue_size: policy.max_queue_size,
                max_retries: policy.max_retries,
                priority_order: policy.priority_order,
            },
        },
        tasks,
    };
    let mut bytes = serde_json::to_vec_pretty(&document).map_err(|err| {
        QueueError::io(
            "Failed to serialize export",
            io::Error::new(io::ErrorKind::InvalidData, err),
        )
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn export_csv(tasks: &[&Task]) -> String {
    let mut out = String::from("id,status,priority,type,created,description\r\n");
    for task in tasks {
        let created = task.created_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let row = [
            csv_field(task.id.as_str()),
            csv_field(task.status.as_str()),
            task.priority.to_string(),
            csv_field(task.task_type.as_str()),
            csv_field(&created),
            csv_field(task.description().unwrap_or("")),
        ];
        out.push_str(&row.join(","));
        out.push_str("\r\n");
    }
    out
}

/// RFC 4180 quoting: fields with commas, quotes or line breaks are wrapped in
/// quotes, and embedded quotes are doubled.
pub(crate) fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ImportSummary {
    pub(crate) total: usize,
    /// In `validate` mode, the inserts a merge would perform.
    pub(crate) inserted: usize,
    /// In `validate` mode, the updates a merge would perform.
    pub(crate) updated: usize,
    pub(crate) failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) errors: Vec<String>,
    #[serde(skip)]
    pub(crate) snapshot: Option<BackupEntry>,
}

impl ImportSummary {
    fn record_failure(&mut self, position: usize, message: String) {
        self.failed += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(format!("tasks[{}]: {}", position, message));
        }
    }
}

/// A task as accepted on import: only `id`, `status` and `priority` are
/// required; the rest fall back to fresh values.
#[derive(Debug, Deserialize)]
struct ImportedTask {
    id: TaskId,
    status: TaskStatus,
    priority: Priority,
    #[serde(rename = "type", default)]
    task_type: Option<TaskType>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl ImportedTask {
    fn into_task(self, now: DateTime<Utc>) -> Task {
        let created_at = self.created_at.unwrap_or(now);
        Task {
            id: self.id,
            task_type: self.task_type.unwrap_or(TaskType::Custom),
            status: self.status,
            priority: self.priority,
            metadata: self.metadata,
            retry_count: self.retry_count,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        }
    }
}

fn parse_imported(value: serde_json::Value, now: DateTime<Utc>) -> Result<Task, String> {
    let serde_json::Value::Object(fields) = &value else {
        return Err("expected an object".to_string());
    };
    for required in ["id", "status", "priority"] {
        if !fields.contains_key(required) {
            return Err(format!("missing required field {:?}", required));
        }
    }
    let imported: ImportedTask = serde_path_to_error::deserialize(value)
        .map_err(|err| format!("{} (at {})", err.inner(), err.path()))?;
    Ok(imported.into_task(now))
}

/// Extracts the `tasks` array from an export or store document. Anything else
/// rejects the whole import before the queue is touched.
fn payload_tasks(data: &[u8]) -> QueueResult<Vec<serde_json::Value>> {
    let document: serde_json::Value = serde_json::from_slice(data)
        .map_err(|err| QueueError::Validation(format!("Import payload is not valid JSON: {}", err)))?;
    let serde_json::Value::Object(mut fields) = document else {
        return Err(QueueError::Validation(
            "Import payload must be a JSON object with a \"tasks\" array".to_string(),
        ));
    };
    match fields.remove("tasks") {
        Some(serde_json::Value::Array(tasks)) => Ok(tasks),
        Some(_) => Err(QueueError::Validation(
            "Import payload member \"tasks\" must be an array".to_string(),
        )),
        None => Err(QueueError::Validation(
            "Import payload is missing the \"tasks\" array".to_string(),
        )),
    }
}

pub(crate) fn import(
    engine: &mut QueueEngine,
    data: &[u8],
    mode: ImportMode,
    backups: &BackupManager,
    now: DateTime<Utc>,
) -> QueueResult<ImportSummary> {
    let tasks = payload_tasks(data)?;
    let mut summary = ImportSummary {
        total: tasks.len(),
        ..ImportSummary::default()
    };

    match mode {
        ImportMode::Validate => {
            let mut seen = std::collections::HashSet::new();
            for (position, value) in tasks.into_iter().enumerate() {
                match parse_imported(value, now) {
                    Ok(task) => {
                        if engine.index().contains(&task.id) || !seen.insert(task.id.clone()) {
                            summary.updated += 1;
                        } else {
                            summary.inserted += 1;
                        }
                    }
                    Err(message) => summary.record_failure(position, message),
                }
            }
        }
        ImportMode::Merge => merge(engine, tasks, now, &mut summary),
        ImportMode::Replace => {
            summary.snapshot = backups.snapshot("pre-import")?;
            engine.clear();
            merge(engine, tasks, now, &mut summary);
        }
    }
    Ok(summary)
}

fn merge(
    engine: &mut QueueEngine,
    tasks: Vec<serde_json::Value>,
    now: DateTime<Utc>,
    summary: &mut ImportSummary,
) {
    for (position, value) in tasks.into_iter().enumerate() {
        let task = match parse_imported(value, now) {
            Ok(task) => task,
            Err(message) => {
                summary.record_failure(position, message);
                continue;
            }
        };
        match engine.upsert(task) {
            Ok(Upsert::Inserted) => summary.inserted += 1,
            Ok(Upsert::Updated) => summary.updated += 1,
            Err(err) => summary.record_failure(position, err.to_string()),
        }
    }
}
