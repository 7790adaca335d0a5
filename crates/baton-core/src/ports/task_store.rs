//! TaskStore port - タスクと同期履歴の正本（source of truth）
//!
//! A document store holding two collections: tasks and their sync-history
//! records. Every state transition of the queue engine goes through
//! `update` with a filter that includes the expected current status, so a
//! transition applies at most once no matter how many workers race on it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::StoreError;
use crate::domain::ids::{SubTaskId, TaskId};
use crate::domain::task::{ResponseEnvelope, SyncHistory, Task, TaskStatus};

/// Conjunction of optional conditions. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub task_ids: Option<Vec<TaskId>>,
    pub names: Option<Vec<String>>,
    pub inst_ids: Option<Vec<i64>>,
    pub statuses: Option<Vec<TaskStatus>>,
    /// Strictly older than.
    pub last_time_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_ids = Some(vec![task_id]);
        self
    }

    pub fn task_ids(mut self, task_ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.task_ids = Some(task_ids.into_iter().collect());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names = Some(vec![name.into()]);
        self
    }

    pub fn names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.names = Some(names.into_iter().collect());
        self
    }

    pub fn inst_id(mut self, inst_id: i64) -> Self {
        self.inst_ids = Some(vec![inst_id]);
        self
    }

    pub fn inst_ids(mut self, inst_ids: impl IntoIterator<Item = i64>) -> Self {
        self.inst_ids = Some(inst_ids.into_iter().collect());
        self
    }

    pub fn statuses(mut self, statuses: &[TaskStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn last_time_before(mut self, threshold: DateTime<Utc>) -> Self {
        self.last_time_before = Some(threshold);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn matches_fields(
        &self,
        task_id: TaskId,
        name: &str,
        inst_id: i64,
        status: TaskStatus,
        last_time: DateTime<Utc>,
    ) -> bool {
        if let Some(ids) = &self.task_ids
            && !ids.contains(&task_id)
        {
            return false;
        }
        if let Some(names) = &self.names
            && !names.iter().any(|n| n == name)
        {
            return false;
        }
        if let Some(inst_ids) = &self.inst_ids
            && !inst_ids.contains(&inst_id)
        {
            return false;
        }
        if let Some(statuses) = &self.statuses
            && !statuses.contains(&status)
        {
            return false;
        }
        if let Some(threshold) = self.last_time_before
            && last_time >= threshold
        {
            return false;
        }
        true
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.matches_fields(
            task.task_id,
            &task.name,
            task.inst_id,
            task.status,
            task.last_time,
        )
    }

    pub fn matches_history(&self, history: &SyncHistory) -> bool {
        self.matches_fields(
            history.task_id,
            &history.name,
            history.inst_id,
            history.status,
            history.last_time,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    CreateTimeAsc,
    CreateTimeDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FindOptions {
    pub sort: SortOrder,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Oldest first, at most `limit` items.
    pub fn oldest(limit: usize) -> Self {
        Self {
            sort: SortOrder::CreateTimeAsc,
            skip: 0,
            limit: Some(limit),
        }
    }
}

/// New state of one sub-task.
#[derive(Debug, Clone, PartialEq)]
pub struct SubTaskPatch {
    pub sub_task_id: SubTaskId,
    pub status: TaskStatus,
    pub response: Option<ResponseEnvelope>,
}

/// Fields written by an update. `last_time` is always bumped.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub sub_task: Option<SubTaskPatch>,
    pub last_time: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            sub_task: None,
            last_time: now,
        }
    }

    pub fn sub_task(patch: SubTaskPatch, now: DateTime<Utc>) -> Self {
        Self {
            status: None,
            sub_task: Some(patch),
            last_time: now,
        }
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(patch) = &self.sub_task
            && let Some(sub) = task.sub_task_mut(patch.sub_task_id)
        {
            sub.status = patch.status;
            sub.response = patch.response.clone();
        }
        task.last_time = self.last_time;
    }

    pub fn apply_history(&self, history: &mut SyncHistory) {
        if let Some(status) = self.status {
            history.status = status;
        }
        history.last_time = self.last_time;
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, tasks: Vec<Task>) -> Result<(), StoreError>;

    async fn find(&self, filter: &TaskFilter, options: FindOptions)
    -> Result<Vec<Task>, StoreError>;

    async fn count(&self, filter: &TaskFilter) -> Result<u64, StoreError>;

    /// Conditional update; returns how many tasks matched `filter`.
    async fn update(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<u64, StoreError>;

    async fn delete(&self, filter: &TaskFilter) -> Result<u64, StoreError>;

    async fn insert_history(&self, records: Vec<SyncHistory>) -> Result<(), StoreError>;

    async fn update_history(
        &self,
        filter: &TaskFilter,
        update: &TaskUpdate,
    ) -> Result<u64, StoreError>;

    async fn find_history(
        &self,
        filter: &TaskFilter,
        options: FindOptions,
    ) -> Result<Vec<SyncHistory>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::SubTask;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn sample_task() -> Task {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Task {
            task_id: TaskId::from_ulid(Ulid::new()),
            name: "sync_host".to_string(),
            inst_id: 42,
            user: "admin".to_string(),
            extra: None,
            sub_tasks: vec![SubTask::new(
                SubTaskId::from_ulid(Ulid::new()),
                serde_json::json!({"ip": "10.0.0.1"}),
            )],
            status: TaskStatus::New,
            create_time: t0,
            last_time: t0,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = TaskFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&sample_task()));
    }

    #[test]
    fn status_guard_excludes_other_statuses() {
        let task = sample_task();
        let guard = TaskFilter::new()
            .task_id(task.task_id)
            .statuses(&TaskStatus::RUNNABLE);
        assert!(guard.matches(&task));

        let executing = Task {
            status: TaskStatus::Executing,
            ..task
        };
        assert!(!guard.matches(&executing));
    }

    #[test]
    fn last_time_before_is_strict() {
        let task = sample_task();
        assert!(!TaskFilter::new().last_time_before(task.last_time).matches(&task));
        assert!(
            TaskFilter::new()
                .last_time_before(task.last_time + chrono::Duration::seconds(1))
                .matches(&task)
        );
    }

    #[test]
    fn update_patches_one_sub_task_and_bumps_last_time() {
        let mut task = sample_task();
        let sub_id = task.sub_tasks[0].sub_task_id;
        let later = task.last_time + chrono::Duration::minutes(1);

        TaskUpdate::sub_task(
            SubTaskPatch {
                sub_task_id: sub_id,
                status: TaskStatus::Success,
                response: Some(ResponseEnvelope::success(serde_json::Value::Null)),
            },
            later,
        )
        .apply(&mut task);

        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.sub_tasks[0].status, TaskStatus::Success);
        assert!(task.sub_tasks[0].response.is_some());
        assert_eq!(task.last_time, later);
    }
}
