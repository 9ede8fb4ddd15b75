use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use crate::task_types::Priority;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) queue_dir: Option<String>,
    /// Maximum number of tasks in the queue; 0 means unlimited.
    pub(crate) max_queue_size: usize,
    pub(crate) max_retries: u32,
    pub(crate) default_priority: Priority,
    pub(crate) priority_order: PriorityOrder,
    /// Terminal tasks older than this are removed by `cleanup`; <= 0 disables.
    pub(crate) task_retention_days: i64,
    pub(crate) log_path: Option<String>,
    pub(crate) lock: LockSettings,
    pub(crate) backups: BackupSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_dir: None,
            max_queue_size: 0,
            max_retries: 3,
            default_priority: Priority::DEFAULT,
            priority_order: PriorityOrder::LowestFirst,
            task_retention_days: 7,
            log_path: None,
            lock: LockSettings::default(),
            backups: BackupSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum PriorityOrder {
    LowestFirst,
    HighestFirst,
}

impl PriorityOrder {
    /// Orders priorities so that the most urgent one compares as `Less`.
    pub(crate) fn urgency_cmp(self, a: Priority, b: Priority) -> Ordering {
        match self {
            Self::LowestFirst => a.cmp(&b),
            Self::HighestFirst => b.cmp(&a),
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::LowestFirst => "lowest_first",
            Self::HighestFirst => "highest_first",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LockBackendKind {
    Directory,
    Flock,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct LockSettings {
    pub(crate) backend: LockBackendKind,
    pub(crate) timeout_secs: u64,
    pub(crate) stale_after_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::Directory,
            timeout_secs: 30,
            stale_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct BackupSettings {
    pub(crate) enabled: bool,
    /// Snapshots older than this are pruned by `backup cleanup`; <= 0 disables.
    pub(crate) retention_days: i64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 7,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) config: Config,
    pub(crate) warnings: Vec<String>,
}

const ALLOWED_KEYS: &[&str] = &[
    "queue_dir",
    "max_queue_size",
    "max_retries",
    "default_priority",
    "priority_order",
    "task_retention_days",
    "log_path",
    "lock",
    "backups",
];

/// Loads `path`, or returns built-in defaults when the file is absent and was
/// not explicitly requested.
pub(crate) fn load_config_or_default(path: &Path, explicit: bool) -> Result<LoadedConfig, String> {
    if !path.is_file() {
        if explicit {
            return Err(format!("Missing config file: {}", path.display()));
        }
        return Ok(LoadedConfig {
            config: Config::default(),
            warnings: Vec::new(),
        });
    }
    load_config(path)
}

pub(crate) fn load_config(path: &Path) -> Result<LoadedConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {}", path.display(), err))?;
    let value: Value = serde_yaml::from_str(&content)
        .map_err(|err| format!("Failed to parse config {}: {}", path.display(), err))?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        // An empty file parses as null; treat it as "all defaults".
        Value::Null => Mapping::new(),
        _ => {
            return Err(format!(
                "Config {} must be a YAML mapping",
                path.display()
            ))
        }
    };

    let warnings = unknown_top_level_keys(&mapping);
    emit_unknown_key_warnings(&warnings);

    let config: Config = serde_path_to_error::deserialize(Value::Mapping(mapping)).map_err(
        |err| {
            format!(
                "Invalid config {}: {} (at {})",
                path.display(),
                err.inner(),
                err.path()
            )
        },
    )?;
    validate_config(&config)
        .map_err(|message| format!("Invalid config {}: {}", path.display(), message))?;

    Ok(LoadedConfig { config, warnings })
}

fn emit_unknown_key_warnings(keys: &[String]) {
    for key in keys {
        eprintln!("Warning: unknown config key: {}", key);
    }
}

fn unknown_top_level_keys(mapping: &Mapping) -> Vec<String> {
    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !ALLOWED_KEYS.contains(&key.as_str()))
        .collect()
}

pub(crate) fn validate_config(config: &Config) -> Result<(), String> {
    if config.lock.stale_after_secs == 0 {
        return Err("lock.stale_after_secs must be a positive integer (got 0)".to_string());
    }
    if let Some(dir) = &config.queue_dir {
        if dir.trim().is_empty() {
            return Err("queue_dir must not be empty".to_string());
        }
    }
    if let Some(log_path) = &config.log_path {
        if log_path.trim().is_empty() {
            return Err("log_path must not be empty".to_string());
        }
    }
    Ok(())
}

/// Expands a leading `~/` against `home`.
pub(crate) fn expand_home(raw: &str, home: Option<&Path>) -> PathBuf {
    let trimmed = raw.trim();
    match (trimmed.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if trimmed == "~" => home.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(trimmed)),
        _ => PathBuf::from(trimmed),
    }
}
