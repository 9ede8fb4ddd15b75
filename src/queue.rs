use chrono::{DateTime, Duration, Utc};

use crate::config::{Config, PriorityOrder};
use crate::error::{QueueError, QueueResult};
use crate::store::{StatusCounts, TaskIndex};
use crate::task_types::{Metadata, Priority, Task, TaskId, TaskStatus, TaskType};

/// How many fresh ids to try before giving up on a generated-id collision.
const ID_ATTEMPTS: usize = 8;

/// Queue-wide limits taken from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuePolicy {
    /// 0 means unlimited.
    pub(crate) max_queue_size: usize,
    pub(crate) max_retries: u32,
    pub(crate) priority_order: PriorityOrder,
}

impl QueuePolicy {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            max_retries: config.max_retries,
            priority_order: config.priority_order,
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NewTask {
    pub(crate) task_type: TaskType,
    pub(crate) priority: Priority,
    pub(crate) id: Option<TaskId>,
    pub(crate) metadata: Metadata,
}

impl NewTask {
    pub(crate) fn new(task_type: TaskType, priority: Priority) -> Self {
        Self {
            task_type,
            priority,
            id: None,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
    Inserted,
    Updated,
}

/// Lifecycle rules applied to a loaded [`TaskIndex`]. Every operation either
/// applies fully or leaves the index untouched.
#[derive(Debug)]
pub(crate) struct QueueEngine {
    index: TaskIndex,
    policy: QueuePolicy,
    dirty: bool,
}

impl QueueEngine {
    pub(crate) fn new(index: TaskIndex, policy: QueuePolicy) -> Self {
        Self {
            index,
            policy,
            dirty: false,
        }
    }

    pub(crate) fn index(&self) -> &TaskIndex {
        &self.index
    }

    #[cfg(test)]
    pub(crate) fn into_index(self) -> TaskIndex {
        self.index
    }

    #[cfg(test)]
    pub(crate) fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// True once any mutation succeeded since load.
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn get(&self, id: &TaskId) -> QueueResult<&Task> {
        self.index
            .get(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    pub(crate) fn counts(&self) -> StatusCounts {
        self.index.counts()
    }

    fn ensure_capacity(&self) -> QueueResult<()> {
        let max = self.policy.max_queue_size;
        if max > 0 && self.index.len() >= max {
            return Err(QueueError::QueueFull { max });
        }
        Ok(())
    }

    pub(crate) fn create_task(&mut self, new: NewTask, now: DateTime<Utc>) -> QueueResult<TaskId> {
        self.ensure_capacity()?;
        let id = match new.id {
            Some(id) => {
                if self.index.contains(&id) {
                    return Err(QueueError::Validation(format!(
                        "Task id already exists: {}",
                        id
                    )));
                }
                id
            }
            None => self.fresh_id(new.task_type, now)?,
        };
        let task = Task::new(id.clone(), new.task_type, new.priority, new.metadata, now);
        self.index.insert(task);
        self.dirty = true;
        Ok(id)
    }

    fn fresh_id(&self, task_type: TaskType, now: DateTime<Utc>) -> QueueResult<TaskId> {
        for _ in 0..ID_ATTEMPTS {
            let id = TaskId::generate(task_type, now);
            if !self.index.contains(&id) {
                return Ok(id);
            }
        }
        Err(QueueError::Validation(
            "Could not generate a unique task id".to_string(),
        ))
    }

    /// Removes a task in any status; removing in-progress work is the caller's call.
    pub(crate) fn remove_task(&mut self, id: &TaskId) -> QueueResult<Task> {
        let task = self
            .index
            .remove(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        self.dirty = true;
        Ok(task)
    }

    pub(crate) fn update_status(
        &mut self,
        id: &TaskId,
        next: TaskStatus,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let max_retries = self.policy.max_retries;
        let task = self
            .index
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        let current = task.status;
        let invalid = |reason: Option<String>| QueueError::InvalidTransition {
            id: id.clone(),
            from: current,
            to: next,
            reason,
        };

        if !current.can_transition_to(next) {
            return Err(invalid(None));
        }
        let retry = current.is_retry_to(next);
        if retry && task.retry_count >= max_retries {
            return Err(invalid(Some(format!(
                "retry budget exhausted ({}/{})",
                task.retry_count, max_retries
            ))));
        }

        task.status = next;
        task.updated_at = now;
        if retry {
            task.retry_count += 1;
        }
        self.dirty = true;
        Ok(())
    }

    /// Legal in every status.
    pub(crate) fn update_priority(
        &mut self,
        id: &TaskId,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let task = self
            .index
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        task.priority = priority;
        task.updated_at = now;
        self.dirty = true;
        Ok(())
    }

    /// The pending task to run next: most urgent priority, then oldest, then
    /// lowest id so the choice never depends on map iteration order.
    pub(crate) fn select_next(&self) -> Option<TaskId> {
        let order = self.policy.priority_order;
        self.index
            .tasks()
            .filter(|task| task.status == TaskStatus::Pending)
            .min_by(|a, b| {
                order
                    .urgency_cmp(a.priority, b.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|task| task.id.clone())
    }

    /// Selects the next pending task and claims it (`pending -> in_progress`).
    pub(crate) fn dequeue(&mut self, now: DateTime<Utc>) -> QueueResult<Option<TaskId>> {
        let Some(id) = self.select_next() else {
            return Ok(None);
        };
        self.update_status(&id, TaskStatus::InProgress, now)?;
        Ok(Some(id))
    }

    /// Removes terminal tasks whose age is at least `max_age_days`. A zero or
    /// negative threshold removes nothing, as does one beyond chrono's range.
    pub(crate) fn cleanup_old_tasks(&mut self, max_age_days: i64, now: DateTime<Utc>) -> usize {
        if max_age_days <= 0 {
            return 0;
        }
        let Some(threshold) = Duration::try_days(max_age_days) else {
            return 0;
        };
        let before = self.index.len();
        self.index
            .retain(|_, task| !(task.status.is_terminal() && now - task.created_at >= threshold));
        let removed = before - self.index.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Inserts `task` or overwrites the task with the same id. Inserts respect
    /// the capacity limit; updates never grow the queue.
    pub(crate) fn upsert(&mut self, task: Task) -> QueueResult<Upsert> {
        let outcome = if self.index.contains(&task.id) {
            Upsert::Updated
        } else {
            self.ensure_capacity()?;
            Upsert::Inserted
        };
        self.index.insert(task);
        self.dirty = true;
        Ok(outcome)
    }

    pub(crate) fn clear(&mut self) {
        if !self.index.is_empty() {
            self.index.clear();
            self.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 9, minute, 0).unwrap()
    }

    fn priority(value: u8) -> Priority {
        Priority::new(value).unwrap()
    }

    fn engine_with(policy: QueuePolicy) -> QueueEngine {
        QueueEngine::new(TaskIndex::new(), policy)
    }

    fn engine() -> QueueEngine {
        engine_with(QueuePolicy::default())
    }

    fn create(engine: &mut QueueEngine, value: u8, minute: u32) -> TaskId {
        engine
            .create_task(NewTask::new(TaskType::Custom, priority(value)), at(minute))
            .expect("create")
    }

    fn force_status(engine: &mut QueueEngine, id: &TaskId, status: TaskStatus) {
        engine.index.get_mut(id).expect("task").status = status;
    }

    #[test]
    fn create_starts_pending_and_marks_dirty() {
        let mut engine = engine();
        assert!(!engine.is_dirty());
        let id = create(&mut engine, 5, 0);
        let task = engine.get(&id).expect("task");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.created_at, at(0));
        assert!(engine.is_dirty());
    }

    #[test]
    fn duplicate_explicit_id_is_rejected_without_mutation() {
        let mut engine = engine();
        let mut new = NewTask::new(TaskType::GithubIssue, priority(2));
        new.id = Some(TaskId::try_from("issue-42").unwrap());
        engine.create_task(new.clone(), at(0)).expect("first");
        let err = engine.create_task(new, at(1)).expect_err("duplicate");
        assert!(matches!(err, QueueError::Validation(_)), "got {err:?}");
        assert_eq!(engine.index().len(), 1);
    }

    #[test]
    fn generated_ids_are_unique() {
        let mut engine = engine();
        let ids: Vec<TaskId> = (0..50).map(|_| create(&mut engine, 5, 0)).collect();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn capacity_is_enforced_on_insert_only() {
        let mut engine = engine_with(QueuePolicy {
            max_queue_size: 1,
            ..QueuePolicy::default()
        });
        let id = create(&mut engine, 5, 0);
        let err = engine
            .create_task(NewTask::new(TaskType::Custom, priority(5)), at(1))
            .expect_err("full");
        assert!(matches!(err, QueueError::QueueFull { max: 1 }));

        let mut updated = engine.get(&id).expect("task").clone();
        updated.priority = priority(1);
        assert_eq!(engine.upsert(updated).expect("update"), Upsert::Updated);
    }

    #[test]
    fn every_transition_outside_the_graph_fails_and_leaves_status() {
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let mut engine = engine();
                let id = create(&mut engine, 5, 0);
                force_status(&mut engine, &id, from);
                let result = engine.update_status(&id, to, at(5));
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{from} -> {to} should succeed");
                    assert_eq!(engine.get(&id).unwrap().status, to);
                    assert_eq!(engine.get(&id).unwrap().updated_at, at(5));
                } else {
                    assert!(
                        matches!(result, Err(QueueError::InvalidTransition { .. })),
                        "{from} -> {to} should fail"
                    );
                    assert_eq!(engine.get(&id).unwrap().status, from);
                    assert_eq!(engine.get(&id).unwrap().updated_at, at(0));
                }
            }
        }
    }

    #[test]
    fn retries_count_up_to_the_budget() {
        let mut engine = engine_with(QueuePolicy {
            max_retries: 2,
            ..QueuePolicy::default()
        });
        let id = create(&mut engine, 5, 0);
        for round in 1..=2 {
            engine.update_status(&id, TaskStatus::InProgress, at(1)).unwrap();
            engine.update_status(&id, TaskStatus::Failed, at(2)).unwrap();
            engine.update_status(&id, TaskStatus::Pending, at(3)).unwrap();
            assert_eq!(engine.get(&id).unwrap().retry_count, round);
        }
        engine.update_status(&id, TaskStatus::InProgress, at(4)).unwrap();
        engine.update_status(&id, TaskStatus::Timeout, at(5)).unwrap();
        let err = engine
            .update_status(&id, TaskStatus::Pending, at(6))
            .expect_err("budget exhausted");
        assert!(err.to_string().contains("retry budget exhausted (2/2)"));
        assert_eq!(engine.get(&id).unwrap().status, TaskStatus::Timeout);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let mut engine = engine();
        let missing = TaskId::try_from("nope").unwrap();
        assert!(matches!(engine.get(&missing), Err(QueueError::NotFound(_))));
        assert!(matches!(
            engine.remove_task(&missing),
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            engine.update_status(&missing, TaskStatus::InProgress, at(0)),
            Err(QueueError::NotFound(_))
        ));
        assert!(matches!(
            engine.update_priority(&missing, priority(1), at(0)),
            Err(QueueError::NotFound(_))
        ));
        assert!(!engine.is_dirty());
    }

    #[test]
    fn priority_update_is_legal_in_terminal_states() {
        let mut engine = engine();
        let id = create(&mut engine, 5, 0);
        force_status(&mut engine, &id, TaskStatus::Completed);
        engine.update_priority(&id, priority(9), at(3)).expect("update");
        assert_eq!(engine.get(&id).unwrap().priority, priority(9));
    }

    #[test]
    fn select_next_prefers_urgency_then_age() {
        let mut engine = engine();
        let _p5 = create(&mut engine, 5, 1);
        let first_urgent = create(&mut engine, 1, 2);
        let second_urgent = create(&mut engine, 1, 3);
        let _p8 = create(&mut engine, 8, 4);

        assert_eq!(engine.select_next(), Some(first_urgent.clone()));
        force_status(&mut engine, &first_urgent, TaskStatus::InProgress);
        assert_eq!(engine.select_next(), Some(second_urgent));
    }

    #[test]
    fn highest_first_order_flips_urgency() {
        let mut engine = engine_with(QueuePolicy {
            priority_order: PriorityOrder::HighestFirst,
            ..QueuePolicy::default()
        });
        create(&mut engine, 1, 0);
        let high = create(&mut engine, 10, 1);
        assert_eq!(engine.select_next(), Some(high));
    }

    #[test]
    fn dequeue_claims_the_selected_task() {
        let mut engine = engine();
        assert_eq!(engine.dequeue(at(0)).expect("empty"), None);
        let id = create(&mut engine, 3, 0);
        assert_eq!(engine.dequeue(at(1)).expect("dequeue"), Some(id.clone()));
        assert_eq!(engine.get(&id).unwrap().status, TaskStatus::InProgress);
        assert_eq!(engine.dequeue(at(2)).expect("drained"), None);
    }

    #[test]
    fn cleanup_removes_only_old_terminal_tasks() {
        let mut engine = engine();
        let now = at(0) + Duration::days(3);
        let old_done = create(&mut engine, 5, 0);
        let old_pending = create(&mut engine, 5, 0);
        let fresh_done = create(&mut engine, 5, 1);
        force_status(&mut engine, &old_done, TaskStatus::Completed);
        force_status(&mut engine, &fresh_done, TaskStatus::Failed);

        assert_eq!(engine.cleanup_old_tasks(0, now), 0);
        assert_eq!(engine.cleanup_old_tasks(-1, now), 0);
        assert_eq!(engine.cleanup_old_tasks(3, now), 1);
        assert!(engine.get(&old_done).is_err());
        assert!(engine.get(&old_pending).is_ok());
        assert!(engine.get(&fresh_done).is_ok());
    }

    #[test]
    fn cleanup_with_unrepresentable_age_removes_nothing() {
        let mut engine = engine();
        let done = create(&mut engine, 5, 0);
        force_status(&mut engine, &done, TaskStatus::Completed);
        let now = at(0) + Duration::days(30);

        assert_eq!(engine.cleanup_old_tasks(200_000_000_000, now), 0);
        assert_eq!(engine.cleanup_old_tasks(i64::MAX, now), 0);
        assert!(engine.get(&done).is_ok());
    }
}
