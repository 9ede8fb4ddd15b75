use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

/// Open key/value map attached to every task.
pub(crate) type Metadata = BTreeMap<String, serde_json::Value>;

pub(crate) const META_DESCRIPTION: &str = "description";
pub(crate) const META_COMPLETION_MARKER: &str = "completion_marker";
pub(crate) const META_COMPLETION_PATTERN: &str = "completion_pattern";
pub(crate) const META_TIMEOUT: &str = "timeout";
pub(crate) const META_CLEAR_CONTEXT: &str = "clear_context";

fn task_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("task id pattern compiles")
    })
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub(crate) struct TaskId(String);

impl TaskId {
    /// Builds `<type>-<unix_ts>-<suffix>` from the creation instant.
    pub(crate) fn generate(task_type: TaskType, now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}",
            task_type.as_str(),
            now.timestamp(),
            &suffix[..8]
        ))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("task id must not be empty".to_string());
        }
        if !task_id_pattern().is_match(trimmed) {
            return Err(format!(
                "invalid task id {:?}: use letters, digits, '.', '_' or '-' (max 128 chars)",
                trimmed
            ));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<&str> for TaskId {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TaskType {
    GithubIssue,
    GithubPr,
    Custom,
}

impl TaskType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::GithubIssue => "github_issue",
            Self::GithubPr => "github_pr",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "github_issue" => Ok(Self::GithubIssue),
            "github_pr" => Ok(Self::GithubPr),
            "custom" => Ok(Self::Custom),
            other => Err(format!(
                "unknown task type {:?} (expected github_issue, github_pr or custom)",
                other
            )),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub(crate) const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Timeout,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    /// Edges of the lifecycle graph. Retry edges (`failed`/`timeout` back to
    /// `pending`) are listed here; the retry budget is checked by the engine.
    pub(crate) fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Timeout)
                | (Self::Failed, Self::Pending)
                | (Self::Timeout, Self::Pending)
        )
    }

    pub(crate) fn is_retry_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Failed, Self::Pending) | (Self::Timeout, Self::Pending)
        )
    }

    /// Display rank used by the `status` sort key.
    pub(crate) fn display_rank(self) -> u8 {
        match self {
            Self::InProgress => 0,
            Self::Pending => 1,
            Self::Failed | Self::Timeout => 2,
            Self::Completed => 3,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!(
                "unknown status {:?} (expected pending, in_progress, completed, failed or timeout)",
                other
            )),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub(crate) struct Priority(u8);

impl Priority {
    pub(crate) const MIN: u8 = 1;
    pub(crate) const MAX: u8 = 10;
    pub(crate) const DEFAULT: Priority = Priority(5);

    pub(crate) fn new(value: u8) -> Result<Self, String> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(format!(
                "priority must be between {} and {} (got {})",
                Self::MIN,
                Self::MAX,
                value
            ));
        }
        Ok(Self(value))
    }

    pub(crate) fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parsed = trimmed
            .parse::<i64>()
            .map_err(|_| format!("priority must be an integer (got {:?})", trimmed))?;
        let narrowed = u8::try_from(parsed).map_err(|_| {
            format!(
                "priority must be between {} and {} (got {})",
                Self::MIN,
                Self::MAX,
                parsed
            )
        })?;
        Self::new(narrowed)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Task {
    pub(crate) id: TaskId,
    #[serde(rename = "type")]
    pub(crate) task_type: TaskType,
    pub(crate) status: TaskStatus,
    pub(crate) priority: Priority,
    #[serde(default)]
    pub(crate) metadata: Metadata,
    #[serde(default)]
    pub(crate) retry_count: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        task_type: TaskType,
        priority: Priority,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            status: TaskStatus::Pending,
            priority,
            metadata,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|value| value.as_str())
            .filter(|value| !value.trim().is_empty())
    }

    pub(crate) fn description(&self) -> Option<&str> {
        self.metadata_str(META_DESCRIPTION)
    }

    pub(crate) fn completion_marker(&self) -> Option<&str> {
        self.metadata_str(META_COMPLETION_MARKER)
    }

    pub(crate) fn completion_pattern(&self) -> Option<&str> {
        self.metadata_str(META_COMPLETION_PATTERN)
    }

    /// Custom execution timeout in seconds. Accepts a JSON number or a numeric string.
    pub(crate) fn timeout_secs(&self) -> Option<u64> {
        match self.metadata.get(META_TIMEOUT)? {
            serde_json::Value::Number(number) => number.as_u64(),
            serde_json::Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub(crate) fn clear_context(&self) -> bool {
        match self.metadata.get(META_CLEAR_CONTEXT) {
            Some(serde_json::Value::Bool(flag)) => *flag,
            Some(serde_json::Value::String(text)) => {
                matches!(text.trim(), "true" | "1" | "yes")
            }
            _ => false,
        }
    }
}

/// Parses `key=value` metadata pairs. Values that parse as JSON scalars
/// (numbers, booleans) keep their type; everything else is stored as a string.
pub(crate) fn parse_metadata_pairs(raw_values: &[String]) -> Result<Metadata, String> {
    let mut metadata = Metadata::new();
    for raw in raw_values {
        let Some((key, value)) = raw.split_once('=') else {
            return Err(format!(
                "Invalid metadata {:?}: expected key=value.",
                raw
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid metadata {:?}: empty key.", raw));
        }
        let parsed = match serde_json::from_str::<serde_json::Value>(value) {
            Ok(scalar @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => scalar,
            _ => serde_json::Value::String(value.to_string()),
        };
        metadata.insert(key.to_string(), parsed);
    }
    Ok(metadata)
}
