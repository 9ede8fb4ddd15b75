use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{QueueError, QueueResult};
use crate::store::{decode_store, write_atomic};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

fn snapshot_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^tasks-(\d{8}T\d{6}\.\d{3}Z)-([a-z0-9-]+)\.json$")
            .expect("snapshot name pattern compiles")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BackupEntry {
    pub(crate) path: PathBuf,
    pub(crate) taken_at: DateTime<Utc>,
    pub(crate) reason: String,
    pub(crate) size: u64,
}

/// Whole-store snapshots kept in a sibling `backups/` directory.
#[derive(Debug, Clone)]
pub(crate) struct BackupManager {
    dir: PathBuf,
    store_path: PathBuf,
}

impl BackupManager {
    pub(crate) fn new(dir: PathBuf, store_path: PathBuf) -> Self {
        Self { dir, store_path }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies the current store file. Returns `None` when there is nothing to copy yet.
    pub(crate) fn snapshot(&self, reason: &str) -> QueueResult<Option<BackupEntry>> {
        self.snapshot_at(reason, Utc::now())
    }

    pub(crate) fn snapshot_at(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<BackupEntry>> {
        let bytes = match fs::read(&self.store_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(QueueError::io(
                    format!("Failed to read store {}", self.store_path.display()),
                    err,
                ))
            }
        };
        fs::create_dir_all(&self.dir).map_err(|err| {
            QueueError::io(
                format!("Failed to create backup directory {}", self.dir.display()),
                err,
            )
        })?;

        let reason = sanitize_reason(reason);
        let stamp = now.format(STAMP_FORMAT).to_string();
        let mut path = self.dir.join(format!("tasks-{}-{}.json", stamp, reason));
        let mut attempt = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("tasks-{}-{}-{}.json", stamp, reason, attempt));
            attempt += 1;
        }

        write_atomic(&path, &bytes).map_err(|err| {
            QueueError::io(format!("Failed to write backup {}", path.display()), err)
        })?;
        Ok(Some(BackupEntry {
            path,
            taken_at: now,
            reason,
            size: bytes.len() as u64,
        }))
    }

    /// Snapshots in the backup directory, newest first. Unrelated files are ignored.
    pub(crate) fn list(&self) -> QueueResult<Vec<BackupEntry>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(QueueError::io(
                    format!("Failed to list backups in {}", self.dir.display()),
                    err,
                ))
            }
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                QueueError::io(
                    format!("Failed to list backups in {}", self.dir.display()),
                    err,
                )
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((taken_at, reason)) = parse_snapshot_name(name) else {
                continue;
            };
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            backups.push(BackupEntry {
                path: entry.path(),
                taken_at,
                reason,
                size,
            });
        }
        backups.sort_by(|a, b| b.taken_at.cmp(&a.taken_at).then_with(|| b.path.cmp(&a.path)));
        Ok(backups)
    }

    pub(crate) fn latest(&self) -> QueueResult<Option<BackupEntry>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Replaces the store with `source` after checking that it parses. The
    /// current store is snapshotted first so a restore can itself be undone.
    pub(crate) fn restore(&self, source: &Path) -> QueueResult<Option<BackupEntry>> {
        let bytes = fs::read(source).map_err(|err| {
            QueueError::io(format!("Failed to read backup {}", source.display()), err)
        })?;
        decode_store(source, &bytes)?;
        let previous = self.snapshot("pre-restore")?;
        write_atomic(&self.store_path, &bytes).map_err(|err| {
            QueueError::io(
                format!("Failed to write store {}", self.store_path.display()),
                err,
            )
        })?;
        Ok(previous)
    }

    /// Deletes snapshots whose age is at least `retention_days`. A zero or
    /// negative window disables pruning, and so does one too long to represent.
    pub(crate) fn cleanup(&self, retention_days: i64) -> QueueResult<usize> {
        self.cleanup_at(retention_days, Utc::now())
    }

    pub(crate) fn cleanup_at(&self, retention_days: i64, now: DateTime<Utc>) -> QueueResult<usize> {
        if retention_days <= 0 {
            return Ok(0);
        }
        let Some(window) = Duration::try_days(retention_days) else {
            return Ok(0);
        };
        let mut removed = 0;
        for entry in self.list()? {
            if now - entry.taken_at < window {
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                // Another process pruned it first.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(QueueError::io(
                        format!("Failed to remove backup {}", entry.path.display()),
                        err,
                    ))
                }
            }
        }
        Ok(removed)
    }
}

fn sanitize_reason(reason: &str) -> String {
    let cleaned: String = reason
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-').to_string();
    if cleaned.is_empty() {
        "manual".to_string()
    } else {
        cleaned
    }
}

fn parse_snapshot_name(name: &str) -> Option<(DateTime<Utc>, String)> {
    let captures = snapshot_name_pattern().captures(name)?;
    let stamp = captures.get(1)?.as_str();
    let reason = captures.get(2)?.as_str().to_string();
    let naive = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    Some((naive.and_utc(), reason))
}
