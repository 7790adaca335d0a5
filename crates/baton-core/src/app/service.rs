//! TaskService - タスクの投入と照会
//!
//! Producer side of the queue. Tasks are created `New` with every sub-task
//! `New`, next to a sync-history record; the worker loops take it from there.
//! Creating a task while an unfinished one exists for the same name and
//! instance is rejected.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::status::QueueCounts;
use crate::domain::errors::TaskError;
use crate::domain::ids::TaskId;
use crate::domain::task::{SubTask, SyncHistory, Task, TaskStatus};
use crate::ports::task_store::{FindOptions, SortOrder, TaskFilter, TaskStore, TaskUpdate};
use crate::ports::{Clock, IdGenerator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    /// Task type; routes the task to one worker loop.
    pub name: String,
    #[serde(default)]
    pub inst_id: i64,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    /// One entry per sub-task, dispatched in order.
    pub data: Vec<serde_json::Value>,
}

impl CreateTaskRequest {
    pub fn new(name: impl Into<String>, inst_id: i64, data: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            inst_id,
            user: String::new(),
            extra: None,
            data,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self { store, ids, clock }
    }

    pub async fn create(&self, request: CreateTaskRequest) -> Result<Task, TaskError> {
        let task = self.build_task(request)?;

        let duplicates = self
            .store
            .find(
                &TaskFilter::new()
                    .name(task.name.clone())
                    .inst_id(task.inst_id)
                    .statuses(&TaskStatus::UNFINISHED),
                FindOptions::default(),
            )
            .await?;
        let unfinished = self.compensate_status(duplicates).await?;
        if !unfinished.is_empty() {
            debug!(name = %task.name, inst_id = task.inst_id, ?unfinished, "unfinished task exists");
            return Err(TaskError::Conflict(vec![task.inst_id]));
        }

        let history = SyncHistory::for_task(&task);
        self.store.insert(vec![task.clone()]).await?;
        self.store.insert_history(vec![history]).await?;
        info!(task_id = %task.task_id, name = %task.name, inst_id = task.inst_id, "task created");
        Ok(task)
    }

    /// All-or-nothing: one invalid or conflicting request rejects the batch.
    pub async fn create_batch(
        &self,
        requests: Vec<CreateTaskRequest>,
    ) -> Result<Vec<Task>, TaskError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let tasks = requests
            .into_iter()
            .map(|request| self.build_task(request))
            .collect::<Result<Vec<_>, _>>()?;

        let pairs: HashSet<(&str, i64)> = tasks
            .iter()
            .map(|task| (task.name.as_str(), task.inst_id))
            .collect();
        let candidates = self
            .store
            .find(
                &TaskFilter::new()
                    .names(pairs.iter().map(|(name, _)| name.to_string()))
                    .inst_ids(pairs.iter().map(|(_, inst_id)| *inst_id))
                    .statuses(&TaskStatus::UNFINISHED),
                FindOptions::default(),
            )
            .await?;
        // names × inst_ids の直積で引いてきたので、実際のペアだけに絞る
        let conflicting: BTreeSet<i64> = candidates
            .iter()
            .filter(|task| pairs.contains(&(task.name.as_str(), task.inst_id)))
            .map(|task| task.inst_id)
            .collect();
        if !conflicting.is_empty() {
            return Err(TaskError::Conflict(conflicting.into_iter().collect()));
        }

        let histories = tasks.iter().map(SyncHistory::for_task).collect();
        self.store.insert(tasks.clone()).await?;
        self.store.insert_history(histories).await?;
        info!(count = tasks.len(), "task batch created");
        Ok(tasks)
    }

    pub async fn detail(&self, task_id: TaskId) -> Result<Option<Task>, TaskError> {
        let mut found = self
            .store
            .find(&TaskFilter::new().task_id(task_id), FindOptions::default())
            .await?;
        Ok(found.pop())
    }

    /// Tasks of type `name` matching `filter`, plus the total before paging.
    pub async fn list(
        &self,
        name: &str,
        filter: TaskFilter,
        options: FindOptions,
    ) -> Result<(Vec<Task>, u64), TaskError> {
        let filter = filter.name(name);
        let total = self.store.count(&filter).await?;
        let tasks = self.store.find(&filter, options).await?;
        Ok((tasks, total))
    }

    /// Most recent task per instance among those matching `filter`.
    pub async fn list_latest(
        &self,
        name: Option<&str>,
        filter: TaskFilter,
    ) -> Result<Vec<Task>, TaskError> {
        let filter = match name {
            Some(name) if !name.is_empty() => filter.name(name),
            _ => filter,
        };
        let newest_first = FindOptions {
            sort: SortOrder::CreateTimeDesc,
            ..FindOptions::default()
        };
        let mut seen = HashSet::new();
        Ok(self
            .store
            .find(&filter, newest_first)
            .await?
            .into_iter()
            .filter(|task| seen.insert(task.inst_id))
            .collect())
    }

    pub async fn delete(&self, filter: TaskFilter) -> Result<u64, TaskError> {
        if filter.is_empty() {
            return Err(TaskError::EmptyCondition);
        }
        let deleted = self.store.delete(&filter).await?;
        info!(deleted, "tasks deleted");
        Ok(deleted)
    }

    /// Settles tasks whose sub-tasks already decide the outcome and returns
    /// the ids of the rest.
    ///
    /// Sub-tasks are read in order and the first one that is not `Success`
    /// decides: `Fail` settles the task as failed, anything else leaves it
    /// unfinished.
    pub async fn compensate_status(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>, TaskError> {
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut unfinished = Vec::new();
        for task in &tasks {
            match task
                .sub_tasks
                .iter()
                .map(|sub| sub.status)
                .find(|status| *status != TaskStatus::Success)
            {
                None => succeeded.push(task.task_id),
                Some(TaskStatus::Fail) => failed.push(task.task_id),
                Some(_) => unfinished.push(task.task_id),
            }
        }

        if !succeeded.is_empty() {
            self.update_task_status(TaskFilter::new().task_ids(succeeded), TaskStatus::Success)
                .await?;
        }
        if !failed.is_empty() {
            self.update_task_status(TaskFilter::new().task_ids(failed), TaskStatus::Fail)
                .await?;
        }
        Ok(unfinished)
    }

    /// Sets the status of the matching tasks and their sync-history records.
    pub async fn update_task_status(
        &self,
        filter: TaskFilter,
        status: TaskStatus,
    ) -> Result<u64, TaskError> {
        let update = TaskUpdate::status(status, self.clock.now());
        let matched = self.store.update(&filter, &update).await?;
        self.store.update_history(&filter, &update).await?;
        Ok(matched)
    }

    pub async fn list_sync_history(
        &self,
        filter: TaskFilter,
        options: FindOptions,
    ) -> Result<Vec<SyncHistory>, TaskError> {
        Ok(self.store.find_history(&filter, options).await?)
    }

    pub async fn queue_counts(&self, name: Option<&str>) -> Result<QueueCounts, TaskError> {
        Ok(QueueCounts::collect(self.store.as_ref(), name).await?)
    }

    fn build_task(&self, request: CreateTaskRequest) -> Result<Task, TaskError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(TaskError::MissingParameter("name"));
        }
        if request.data.is_empty() {
            return Err(TaskError::MissingParameter("data"));
        }

        let now = self.clock.now();
        Ok(Task {
            task_id: self.ids.generate_task_id(),
            name: name.to_string(),
            inst_id: request.inst_id,
            user: request.user,
            extra: request.extra,
            sub_tasks: request
                .data
                .into_iter()
                .map(|data| SubTask::new(self.ids.generate_sub_task_id(), data))
                .collect(),
            status: TaskStatus::New,
            create_time: now,
            last_time: now,
        })
    }
}
