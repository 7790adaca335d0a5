//! Status - キューの状態ビュー

use serde::Serialize;

use crate::domain::errors::StoreError;
use crate::domain::task::TaskStatus;
use crate::ports::task_store::{TaskFilter, TaskStore};

/// Number of tasks per status, optionally for one task type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub new: u64,
    pub wait_execute: u64,
    pub executing: u64,
    pub success: u64,
    pub fail: u64,
}

impl QueueCounts {
    pub async fn collect(store: &dyn TaskStore, name: Option<&str>) -> Result<Self, StoreError> {
        let mut counts = Self::default();
        for status in [
            TaskStatus::New,
            TaskStatus::WaitExecute,
            TaskStatus::Executing,
            TaskStatus::Success,
            TaskStatus::Fail,
        ] {
            let mut filter = TaskFilter::new().statuses(&[status]);
            if let Some(name) = name {
                filter = filter.name(name);
            }
            let n = store.count(&filter).await?;
            match status {
                TaskStatus::New => counts.new = n,
                TaskStatus::WaitExecute => counts.wait_execute = n,
                TaskStatus::Executing => counts.executing = n,
                TaskStatus::Success => counts.success = n,
                TaskStatus::Fail => counts.fail = n,
            }
        }
        Ok(counts)
    }

    /// Tasks not in a terminal status.
    pub fn pending(&self) -> u64 {
        self.new + self.wait_execute + self.executing
    }
}
