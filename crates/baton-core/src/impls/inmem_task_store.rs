//! In-memory task store.
//!
//! Holds the two collections behind one `tokio::sync::Mutex`, so every
//! call, conditional updates included, is atomic. Write failures can be
//! injected to exercise the bounded-retry paths of the queue engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::errors::StoreError;
use crate::domain::ids::TaskId;
use crate::domain::task::{SyncHistory, Task};
use crate::ports::task_store::{FindOptions, SortOrder, TaskFilter, TaskStore, TaskUpdate};

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    histories: HashMap<TaskId, SyncHistory>,
    /// Number of upcoming write calls that fail.
    failing_writes: u32,
    /// Reads fail while set.
    unavailable: bool,
    write_calls: u64,
}

impl StoreState {
    fn check_read(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("task store is offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&mut self) -> Result<(), StoreError> {
        self.write_calls += 1;
        self.check_read()?;
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Write("injected write failure".to_string()));
        }
        Ok(())
    }
}

/// Sort by `(create_time, task_id)`, then skip/limit.
fn page<T, F>(mut items: Vec<T>, options: FindOptions, sort_key: F) -> Vec<T>
where
    F: Fn(&T) -> (DateTime<Utc>, TaskId),
{
    items.sort_by_key(|item| sort_key(item));
    if options.sort == SortOrder::CreateTimeDesc {
        items.reverse();
    }
    let limit = options.limit.unwrap_or(usize::MAX);
    items.into_iter().skip(options.skip).take(limit).collect()
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with `StoreError::Write`.
    pub async fn fail_next_writes(&self, n: u32) {
        self.state.lock().await.failing_writes = n;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Write calls seen so far, failed ones included.
    pub async fn write_calls(&self) -> u64 {
        self.state.lock().await.write_calls
    }

    pub async fn get(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&task_id).cloned()
    }

    pub async fn history(&self, task_id: TaskId) -> Option<SyncHistory> {
        self.state.lock().await.histories.get(&task_id).cloned()
    }

    /// Overwrite a task as-is, bypassing every guard. Test setup only.
    pub async fn put(&self, task: Task) {
        self.state.lock().await.tasks.insert(task.task_id, task);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, tasks: Vec<Task>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        if let Some(dup) = tasks.iter().find(|t| state.tasks.contains_key(&t.task_id)) {
            return Err(StoreError::Duplicate(dup.task_id));
        }
        for task in tasks {
            state.tasks.insert(task.task_id, task);
        }
        Ok(())
    }

    async fn find(
        &self,
        filter: &TaskFilter,
        options: FindOptions,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        state.check_read()?;
        let matched: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        Ok(page(matched, options, |t| (t.create_time, t.task_id)))
    }

    async fn count(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        state.check_read()?;
        Ok(state.tasks.values().filter(|task| filter.matches(task)).count() as u64)
    }

    async fn update(&self, filter: &TaskFilter, update: &TaskUpdate) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let mut matched = 0;
        for task in state.tasks.values_mut().filter(|task| filter.matches(task)) {
            update.apply(task);
            matched += 1;
        }
        Ok(matched)
    }

    async fn delete(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !filter.matches(task));
        Ok((before - state.tasks.len()) as u64)
    }

    async fn insert_history(&self, records: Vec<SyncHistory>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        for record in records {
            state.histories.insert(record.task_id, record);
        }
        Ok(())
    }

    async fn update_history(
        &self,
        filter: &TaskFilter,
        update: &TaskUpdate,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_write()?;
        let mut matched = 0;
        for history in state
            .histories
            .values_mut()
            .filter(|history| filter.matches_history(history))
        {
            update.apply_history(history);
            matched += 1;
        }
        Ok(matched)
    }

    async fn find_history(
        &self,
        filter: &TaskFilter,
        options: FindOptions,
    ) -> Result<Vec<SyncHistory>, StoreError> {
        let state = self.state.lock().await;
        state.check_read()?;
        let matched: Vec<SyncHistory> = state
            .histories
            .values()
            .filter(|history| filter.matches_history(history))
            .cloned()
            .collect();
        Ok(page(matched, options, |h| (h.create_time, h.task_id)))
    }
}
