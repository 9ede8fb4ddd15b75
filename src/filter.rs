use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use std::cmp::Ordering;
use std::str::FromStr;

use crate::config::PriorityOrder;
use crate::store::TaskIndex;
use crate::task_types::{Priority, Task, TaskStatus, TaskType};

/// Inclusive priority bounds, parsed from `N` or `A-B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PriorityRange {
    low: Priority,
    high: Priority,
}

impl PriorityRange {
    pub(crate) fn contains(self, priority: Priority) -> bool {
        self.low <= priority && priority <= self.high
    }
}

impl FromStr for PriorityRange {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (low, high) = match trimmed.split_once('-') {
            Some((low, high)) => (low.parse::<Priority>()?, high.parse::<Priority>()?),
            None => {
                let exact = trimmed.parse::<Priority>()?;
                (exact, exact)
            }
        };
        if low > high {
            return Err(format!(
                "invalid priority range {:?}: lower bound exceeds upper bound",
                trimmed
            ));
        }
        Ok(Self { low, high })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub(crate) enum SortKey {
    /// Most urgent first, oldest first within a priority.
    #[default]
    Priority,
    /// Newest first.
    Created,
    /// in_progress, pending, failed/timeout, completed.
    Status,
}

/// Predicates over tasks. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskFilter {
    pub(crate) statuses: Vec<TaskStatus>,
    pub(crate) priority: Option<PriorityRange>,
    pub(crate) task_type: Option<TaskType>,
    pub(crate) created_after: Option<DateTime<Utc>>,
    pub(crate) created_before: Option<DateTime<Utc>>,
    /// Lowercased substring matched against metadata keys and values.
    search: Option<String>,
}

impl TaskFilter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_statuses(mut self, statuses: Vec<TaskStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub(crate) fn with_priority(mut self, range: PriorityRange) -> Self {
        self.priority = Some(range);
        self
    }

    pub(crate) fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub(crate) fn created_after(mut self, after: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self
    }

    pub(crate) fn created_before(mut self, before: DateTime<Utc>) -> Self {
        self.created_before = Some(before);
        self
    }

    pub(crate) fn with_search(mut self, needle: &str) -> Self {
        let needle = needle.trim();
        self.search = (!needle.is_empty()).then(|| needle.to_lowercase());
        self
    }

    pub(crate) fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if self
            .priority
            .is_some_and(|range| !range.contains(task.priority))
        {
            return false;
        }
        if self.task_type.is_some_and(|kind| kind != task.task_type) {
            return false;
        }
        if self.created_after.is_some_and(|after| task.created_at < after) {
            return false;
        }
        if self
            .created_before
            .is_some_and(|before| task.created_at > before)
        {
            return false;
        }
        match &self.search {
            Some(needle) => metadata_contains(task, needle),
            None => true,
        }
    }
}

fn metadata_contains(task: &Task, needle: &str) -> bool {
    task.metadata.iter().any(|(key, value)| {
        if key.to_lowercase().contains(needle) {
            return true;
        }
        let text = match value {
            serde_json::Value::String(text) => text.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        text.contains(needle)
    })
}

#[derive(Debug, Clone, Default)]
pub(crate) struct TaskQuery {
    pub(crate) filter: TaskFilter,
    pub(crate) sort: SortKey,
    pub(crate) limit: Option<usize>,
}

impl TaskQuery {
    pub(crate) fn new(filter: TaskFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub(crate) fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    pub(crate) fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// Filters, sorts, then truncates. The limit never applies before filtering.
pub(crate) fn run_query<'a>(
    index: &'a TaskIndex,
    query: &TaskQuery,
    order: PriorityOrder,
) -> Vec<&'a Task> {
    let mut tasks: Vec<&Task> = index
        .tasks()
        .filter(|task| query.filter.matches(task))
        .collect();
    tasks.sort_by(|a, b| compare(query.sort, order, a, b));
    if let Some(limit) = query.limit {
        tasks.truncate(limit);
    }
    tasks
}

fn compare(sort: SortKey, order: PriorityOrder, a: &Task, b: &Task) -> Ordering {
    let by_priority = || {
        order
            .urgency_cmp(a.priority, b.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    };
    let ordering = match sort {
        SortKey::Priority => by_priority(),
        SortKey::Created => b.created_at.cmp(&a.created_at),
        SortKey::Status => a
            .status
            .display_rank()
            .cmp(&b.status.display_rank())
            .then_with(by_priority),
    };
    ordering.then_with(|| a.id.cmp(&b.id))
}

/// Parses an RFC 3339 instant or a `YYYY-MM-DD` date. A bare date stands for
/// its first instant, or its last when `end_of_day` is set, so date bounds
/// include the whole day.
pub(crate) fn parse_time_bound(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, String> {
    let trimmed = raw.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| {
        format!(
            "invalid time {:?}: expected RFC 3339 (2026-10-16T08:30:00Z) or YYYY-MM-DD",
            trimmed
        )
    })?;
    let time = if end_of_day {
        date.and_hms_nano_opt(23, 59, 59, 999_999_999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid time {:?}", trimmed))
}

/// Parses status names, dropping repeats.
pub(crate) fn parse_statuses(values: &[String]) -> Result<Vec<TaskStatus>, String> {
    let mut statuses = Vec::new();
    for value in values {
        let status = value.parse::<TaskStatus>()?;
        if !statuses.contains(&status) {
            statuses.push(status);
        }
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_types::{Metadata, TaskId};
    use chrono::TimeZone;

    fn task(id: &str, status: TaskStatus, priority: u8, day: u32) -> Task {
        let created = Utc.with_ymd_and_hms(2026, 10, day, 12, 0, 0).unwrap();
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

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|task| task.id.to_string()).collect()
    }

    #[test]
    fn priority_range_parses_exact_and_span() {
        let exact: PriorityRange = "4".parse().unwrap();
        assert!(exact.contains(Priority::new(4).unwrap()));
        assert!(!exact.contains(Priority::new(5).unwrap()));

        let span: PriorityRange = " 1-3 ".parse().unwrap();
        assert!(span.contains(Priority::new(1).unwrap()));
        assert!(span.contains(Priority::new(3).unwrap()));
        assert!(!span.contains(Priority::new(4).unwrap()));

        assert!("3-1".parse::<PriorityRange>().is_err());
        assert!("0-3".parse::<PriorityRange>().is_err());
        assert!("a-b".parse::<PriorityRange>().is_err());
    }

    #[test]
    fn filters_compose() {
        let mut issue = task("issue", TaskStatus::Pending, 2, 3);
        issue.task_type = TaskType::GithubIssue;
        let index = TaskIndex::from_tasks(vec![
            issue,
            task("pending", TaskStatus::Pending, 2, 3),
            task("done", TaskStatus::Completed, 2, 3),
            task("late", TaskStatus::Pending, 2, 9),
        ])
        .unwrap();

        let filter = TaskFilter::new()
            .with_statuses(vec![TaskStatus::Pending])
            .with_type(TaskType::Custom)
            .created_before(parse_time_bound("2026-10-03", true).unwrap());
        let found = run_query(&index, &TaskQuery::new(filter), PriorityOrder::LowestFirst);
        assert_eq!(ids(&found), vec!["pending"]);
    }

    #[test]
    fn date_bounds_cover_whole_days() {
        let after = parse_time_bound("2026-10-03", false).unwrap();
        let before = parse_time_bound("2026-10-03", true).unwrap();
        assert_eq!(after, Utc.with_ymd_and_hms(2026, 10, 3, 0, 0, 0).unwrap());
        assert!(before > Utc.with_ymd_and_hms(2026, 10, 3, 23, 59, 59).unwrap());

        let exact = parse_time_bound("2026-10-03T05:00:00+02:00", false).unwrap();
        assert_eq!(exact, Utc.with_ymd_and_hms(2026, 10, 3, 3, 0, 0).unwrap());
        assert!(parse_time_bound("yesterday", false).is_err());
    }

    #[test]
    fn search_is_case_insensitive_over_keys_and_values() {
        let mut described = task("described", TaskStatus::Pending, 5, 1);
        described.metadata.insert(
            "description".to_string(),
            serde_json::Value::String("Fix the Login page".to_string()),
        );
        let mut numbered = task("numbered", TaskStatus::Pending, 5, 1);
        numbered
            .metadata
            .insert("Issue_Number".to_string(), serde_json::json!(4242));
        let index = TaskIndex::from_tasks(vec![described, numbered]).unwrap();

        let query = |needle: &str| {
            let found = run_query(
                &index,
                &TaskQuery::new(TaskFilter::new().with_search(needle)),
                PriorityOrder::LowestFirst,
            );
            ids(&found)
        };
        assert_eq!(query("LOGIN"), vec!["described"]);
        assert_eq!(query("issue_number"), vec!["numbered"]);
        assert_eq!(query("424"), vec!["numbered"]);
        assert!(query("nothing").is_empty());
    }

    #[test]
    fn sort_keys_order_results() {
        let index = TaskIndex::from_tasks(vec![
            task("old-p5", TaskStatus::Completed, 5, 1),
            task("new-p5", TaskStatus::Pending, 5, 4),
            task("mid-p1", TaskStatus::InProgress, 1, 2),
            task("p9", TaskStatus::Failed, 9, 3),
        ])
        .unwrap();
        let run = |sort| {
            ids(&run_query(
                &index,
                &TaskQuery::new(TaskFilter::new()).sorted_by(sort),
                PriorityOrder::LowestFirst,
            ))
        };
        assert_eq!(
            run(SortKey::Priority),
            vec!["mid-p1", "old-p5", "new-p5", "p9"]
        );
        assert_eq!(run(SortKey::Created), vec!["new-p5", "p9", "mid-p1", "old-p5"]);
        assert_eq!(run(SortKey::Status), vec!["mid-p1", "new-p5", "p9", "old-p5"]);
    }

    #[test]
    fn limit_truncates_after_filtering() {
        let index = TaskIndex::from_tasks(vec![
            task("a", TaskStatus::Completed, 1, 1),
            task("b", TaskStatus::Pending, 2, 1),
            task("c", TaskStatus::Pending, 3, 1),
            task("d", TaskStatus::Pending, 4, 1),
        ])
        .unwrap();
        let query = TaskQuery::new(TaskFilter::new().with_statuses(vec![TaskStatus::Pending]))
            .with_limit(Some(2));
        let found = run_query(&index, &query, PriorityOrder::LowestFirst);
        assert_eq!(ids(&found), vec!["b", "c"]);
    }

    #[test]
    fn statuses_parse_and_dedupe() {
        let values = ["pending", "in_progress", "pending"].map(String::from);
        assert_eq!(
            parse_statuses(&values).unwrap(),
            vec![TaskStatus::Pending, TaskStatus::InProgress]
        );
        assert!(parse_statuses(&["done".to_string()]).is_err());
    }
}
