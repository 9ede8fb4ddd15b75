use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::backup::BackupManager;
use crate::error::{QueueError, QueueResult};
use crate::logger::Logger;
use crate::task_types::{Task, TaskId, TaskStatus};

pub(crate) const STORE_VERSION: u32 = 1;

/// In-memory view of every task, keyed by id. Rebuilt from disk on each load.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TaskIndex {
    tasks: HashMap<TaskId, Task>,
}

impl TaskIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Builds an index, rejecting the first duplicated id.
    pub(crate) fn from_tasks(tasks: Vec<Task>) -> Result<Self, TaskId> {
        let mut index = Self::new();
        for task in tasks {
            if index.tasks.contains_key(&task.id) {
                return Err(task.id);
            }
            index.tasks.insert(task.id.clone(), task);
        }
        Ok(index)
    }

    pub(crate) fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub(crate) fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub(crate) fn insert(&mut self, task: Task) -> Option<Task> {
        self.tasks.insert(task.id.clone(), task)
    }

    pub(crate) fn remove(&mut self, id: &TaskId) -> Option<Task> {
        self.tasks.remove(id)
    }

    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&TaskId, &mut Task) -> bool) {
        self.tasks.retain(keep);
    }

    /// Tasks in a stable order: oldest first, id as tie-break.
    pub(crate) fn sorted(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    pub(crate) fn counts(&self) -> StatusCounts {
        StatusCounts::of(self.tasks.values())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StatusCounts {
    pub(crate) pending: usize,
    pub(crate) in_progress: usize,
    pub(crate) completed: usize,
    pub(crate) failed: usize,
    pub(crate) timeout: usize,
}

impl StatusCounts {
    pub(crate) fn of<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            counts.bump(task.status);
        }
        counts
    }

    fn bump(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Timeout => self.timeout += 1,
        }
    }

    pub(crate) fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Timeout => self.timeout,
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.timeout
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    updated_at: DateTime<Utc>,
    total_tasks: usize,
    counts: StatusCounts,
}

#[derive(Debug, Deserialize)]
struct StoreDocument {
    version: u32,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<StoreMetadata>,
    tasks: Vec<Task>,
}

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    version: u32,
    metadata: StoreMetadata,
    tasks: Vec<&'a Task>,
}

/// The on-disk JSON document holding every task.
#[derive(Debug)]
pub(crate) struct Store {
    path: PathBuf,
    backups: Option<BackupManager>,
}

impl Store {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, backups: None }
    }

    /// Snapshot the previous document through `backups` before every overwrite.
    pub(crate) fn with_backups(mut self, backups: BackupManager) -> Self {
        self.backups = Some(backups);
        self
    }

    pub(crate) fn load(&self) -> QueueResult<TaskIndex> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(TaskIndex::new()),
            Err(err) => {
                return Err(QueueError::io(
                    format!("Failed to read store {}", self.path.display()),
                    err,
                ))
            }
        };
        decode_store(&self.path, &bytes)
    }

    pub(crate) fn save(&self, index: &TaskIndex, logger: &Logger) -> QueueResult<()> {
        if let Some(backups) = &self.backups {
            if let Some(entry) = backups.snapshot("save")? {
                logger.log_event("backup", &[("reason", &"save"), ("path", &entry.path.display())]);
            }
        }
        let bytes = encode_store(index, Utc::now())?;
        write_atomic(&self.path, &bytes).map_err(|err| {
            QueueError::io(format!("Failed to write store {}", self.path.display()), err)
        })?;
        logger.log_event(
            "store_saved",
            &[("tasks", &index.len()), ("path", &self.path.display())],
        );
        Ok(())
    }
}

pub(crate) fn encode_store(index: &TaskIndex, now: DateTime<Utc>) -> QueueResult<Vec<u8>> {
    let document = StoreDocumentRef {
        version: STORE_VERSION,
        metadata: StoreMetadata {
            updated_at: now,
            total_tasks: index.len(),
            counts: index.counts(),
        },
        tasks: index.sorted(),
    };
    let mut bytes = serde_json::to_vec_pretty(&document).map_err(|err| {
        QueueError::io(
            "Failed to serialize store",
            io::Error::new(io::ErrorKind::InvalidData, err),
        )
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parses and validates a store document. Every failure names `path` and,
/// where possible, the JSON path of the offending value.
pub(crate) fn decode_store(path: &Path, bytes: &[u8]) -> QueueResult<TaskIndex> {
    let corrupt = |detail: String| QueueError::CorruptStore {
        path: path.to_path_buf(),
        detail,
    };

    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    let document: StoreDocument = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| corrupt(format!("{} (at {})", err.inner(), err.path())))?;
    deserializer
        .end()
        .map_err(|err| corrupt(err.to_string()))?;

    if document.version > STORE_VERSION {
        return Err(corrupt(format!(
            "unsupported store version {} (this build reads up to {})",
            document.version, STORE_VERSION
        )));
    }

    TaskIndex::from_tasks(document.tasks)
        .map_err(|id| corrupt(format!("duplicate task id {}", id)))
}

/// Writes `bytes` to a temp file beside `path`, syncs it, then renames it over
/// `path`. Readers observe either the old or the new file, never a partial one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_types::{Metadata, Priority, TaskType};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn task(id: &str, status: TaskStatus, priority: u8, minute: u32) -> Task {
        let created = Utc.with_ymd_and_hms(2026, 10, 1, 9, minute, 0).unwrap();
        let mut task = Task::new(
            TaskId::try_from(id).unwrap(),
            TaskType::Custom,
            Priority::new(priority).unwrap(),
            Metadata::new(),
            created,
        );
        task.status = status;
        task
    }

    fn index_of(tasks: Vec<Task>) -> TaskIndex {
        TaskIndex::from_tasks(tasks).expect("unique ids")
    }

    #[test]
    fn load_of_missing_file_is_empty() {
        let temp = TempDir::new().expect("temp dir");
        let store = Store::new(temp.path().join("tasks.json"));
        assert!(store.load().expect("load").is_empty());
    }

    #[test]
    fn save_then_load_reproduces_index() {
        let temp = TempDir::new().expect("temp dir");
        let store = Store::new(temp.path().join("tasks.json"));
        let mut first = task("a-1", TaskStatus::Pending, 3, 1);
        first
            .metadata
            .insert("description".to_string(), serde_json::json!("first, \"quoted\""));
        let index = index_of(vec![first, task("b-2", TaskStatus::Failed, 7, 2)]);

        store.save(&index, &Logger::disabled()).expect("save");
        let loaded = store.load().expect("load");
        assert_eq!(loaded, index);
    }

    #[test]
    fn saved_document_carries_metadata_envelope() {
        let index = index_of(vec![
            task("a-1", TaskStatus::Pending, 3, 1),
            task("b-2", TaskStatus::Completed, 3, 2),
        ]);
        let bytes = encode_store(&index, Utc::now()).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["version"], 1);
        assert_eq!(value["metadata"]["total_tasks"], 2);
        assert_eq!(value["metadata"]["counts"]["completed"], 1);
        assert_eq!(value["tasks"][0]["id"], "a-1");
        assert_eq!(value["tasks"][1]["type"], "custom");
    }

    #[test]
    fn malformed_json_is_corrupt_store() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("tasks.json");
        fs::write(&path, "{\"version\": 1, \"tasks\": [").expect("write");
        let err = Store::new(path.clone()).load().expect_err("corrupt");
        match err {
            QueueError::CorruptStore { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("expected CorruptStore, got {other:?}"),
        }
    }

    #[test]
    fn schema_violations_name_the_json_path() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("tasks.json");
        let body = r#"{"version": 1, "tasks": [
            {"id": "x-1", "type": "custom", "status": "pending", "priority": 99,
             "created_at": "2026-10-01T09:00:00Z", "updated_at": "2026-10-01T09:00:00Z"}
        ]}"#;
        fs::write(&path, body).expect("write");
        let err = Store::new(path).load().expect_err("corrupt");
        let message = err.to_string();
        assert!(message.contains("tasks[0].priority"), "got: {message}");
    }

    #[test]
    fn duplicate_ids_and_future_versions_are_rejected() {
        let duplicate = index_of(vec![task("a-1", TaskStatus::Pending, 1, 1)]);
        let bytes = encode_store(&duplicate, Utc::now()).expect("encode");
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        let copy = value["tasks"][0].clone();
        value["tasks"].as_array_mut().expect("array").push(copy);
        let err = decode_store(Path::new("t.json"), value.to_string().as_bytes())
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate task id a-1"));

        let future = r#"{"version": 99, "tasks": []}"#;
        let err = decode_store(Path::new("t.json"), future.as_bytes()).expect_err("version");
        assert!(matches!(err, QueueError::CorruptStore { .. }));
    }

    #[test]
    fn empty_file_is_corrupt_not_empty() {
        let err = decode_store(Path::new("t.json"), b"").expect_err("truncated");
        assert!(matches!(err, QueueError::CorruptStore { .. }));
    }

    #[test]
    fn orphaned_temp_file_never_replaces_the_store() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("tasks.json");
        let store = Store::new(path.clone());
        let index = index_of(vec![task("a-1", TaskStatus::Pending, 2, 1)]);
        store.save(&index, &Logger::disabled()).expect("save");

        // A writer killed between the temp write and the rename leaves only a
        // half-written sibling behind.
        let mut orphan = NamedTempFile::new_in(temp.path()).expect("temp");
        orphan.write_all(b"{\"version\": 1, \"tas").expect("partial write");
        let (_file, _orphan_path) = orphan.keep().expect("keep orphan");

        let loaded = store.load().expect("store still valid");
        assert_eq!(loaded, index);
    }

    #[test]
    fn write_atomic_replaces_whole_file() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("nested").join("file.json");
        write_atomic(&path, b"first version that is long").expect("write");
        write_atomic(&path, b"second").expect("overwrite");
        assert_eq!(fs::read(&path).expect("read"), b"second");
    }
}
