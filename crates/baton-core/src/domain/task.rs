//! Task records as persisted in the task store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{SubTaskId, TaskId};

/// Status shared by tasks and sub-tasks.
///
/// Task transitions:
/// - New | WaitExecute -> Executing (lock acquired while leading)
/// - Executing -> Success | Fail
/// - Executing -> WaitExecute (orphan recovered by the compensator)
///
/// Sub-tasks never enter `Executing`; that state only exists at task level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    WaitExecute,
    Executing,
    Success,
    Fail,
}

impl TaskStatus {
    /// Entry states a worker may pick up. `New` and `WaitExecute` are equivalent.
    pub const RUNNABLE: [TaskStatus; 2] = [TaskStatus::New, TaskStatus::WaitExecute];

    /// States of a task that has not reached a terminal status yet.
    pub const UNFINISHED: [TaskStatus; 3] = [
        TaskStatus::New,
        TaskStatus::WaitExecute,
        TaskStatus::Executing,
    ];

    pub fn is_runnable(self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::WaitExecute)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Fail)
    }
}

/// Result envelope returned by downstream services.
///
/// Also stored as the terminal response of a sub-task, including for
/// transport failures where no envelope was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub result: bool,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ResponseEnvelope {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            result: true,
            code: 0,
            message: "success".to_string(),
            data,
        }
    }

    pub fn failure(code: i64, message: impl Into<String>) -> Self {
        Self {
            result: false,
            code,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// One ordered step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub sub_task_id: SubTaskId,
    pub data: serde_json::Value,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseEnvelope>,
}

impl SubTask {
    pub fn new(sub_task_id: SubTaskId, data: serde_json::Value) -> Self {
        Self {
            sub_task_id,
            data,
            status: TaskStatus::New,
            response: None,
        }
    }
}

/// A unit of deferred work routed by `name` to one worker loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub name: String,
    #[serde(default)]
    pub inst_id: i64,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
    pub sub_tasks: Vec<SubTask>,
    pub status: TaskStatus,
    pub create_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
}

impl Task {
    /// Status implied by the sub-tasks alone.
    ///
    /// Any failed sub-task latches `Fail`; all successful gives `Success`;
    /// anything else is still `Executing`.
    pub fn aggregate_status(&self) -> TaskStatus {
        if self
            .sub_tasks
            .iter()
            .any(|sub| sub.status == TaskStatus::Fail)
        {
            return TaskStatus::Fail;
        }
        if self
            .sub_tasks
            .iter()
            .all(|sub| sub.status == TaskStatus::Success)
        {
            return TaskStatus::Success;
        }
        TaskStatus::Executing
    }

    pub fn sub_task(&self, sub_task_id: SubTaskId) -> Option<&SubTask> {
        self.sub_tasks
            .iter()
            .find(|sub| sub.sub_task_id == sub_task_id)
    }

    pub fn sub_task_mut(&mut self, sub_task_id: SubTaskId) -> Option<&mut SubTask> {
        self.sub_tasks
            .iter_mut()
            .find(|sub| sub.sub_task_id == sub_task_id)
    }
}

/// Status history kept next to each task for producers to query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistory {
    pub task_id: TaskId,
    pub name: String,
    pub inst_id: i64,
    pub status: TaskStatus,
    pub creator: String,
    pub create_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl SyncHistory {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            name: task.name.clone(),
            inst_id: task.inst_id,
            status: task.status,
            creator: task.user.clone(),
            create_time: task.create_time,
            last_time: task.last_time,
            extra: task.extra.clone(),
        }
    }
}

/// Key of the distributed lock guarding one task.
pub fn task_lock_key(task_id: TaskId) -> String {
    format!("task_lock:{task_id}")
}
