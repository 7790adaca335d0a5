//! QueueBuilder - キューの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::app::compensator::Compensator;
use crate::app::context::QueueContext;
use crate::app::worker_loop::{TaskType, TaskWorker, WorkerGroup};
use crate::config::{BatonConfig, CompensatorConfig, ConfigError};

/// QueueBuilder は TaskQueue を構築
///
/// # 使用例
/// ```ignore
/// let queue = QueueBuilder::new(ctx)
///     .register(TaskType::from_config(&sync_host))?
///     .expect_tasks(&["sync_host"])
///     .build()?;
/// let workers = queue.start();
/// ```
///
/// # Fail-fast 設計
/// - register() で task type の設定値を検証
/// - expect_tasks() で期待される task type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
pub struct QueueBuilder {
    ctx: QueueContext,
    task_types: BTreeMap<String, Arc<TaskType>>,
    expected_tasks: Option<Vec<String>>,
    compensator: Option<CompensatorConfig>,
}

/// BuildError はキュー構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Task type '{0}' is registered more than once.")]
    DuplicateTaskType(String),

    #[error("Task type '{task_type}' is invalid: {reason}")]
    InvalidTaskType { task_type: String, reason: String },

    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QueueBuilder {
    pub fn new(ctx: QueueContext) -> Self {
        Self {
            ctx,
            task_types: BTreeMap::new(),
            expected_tasks: None,
            compensator: None,
        }
    }

    /// Every task type of `config`, plus the compensator.
    pub fn from_config(ctx: QueueContext, config: &BatonConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let mut builder = Self::new(ctx).with_compensator(config.compensator.clone());
        for task_type in &config.task_types {
            builder = builder.register(TaskType::from_config(task_type))?;
        }
        Ok(builder)
    }

    pub fn register(mut self, task_type: TaskType) -> Result<Self, BuildError> {
        let invalid = |reason: &str| BuildError::InvalidTaskType {
            task_type: task_type.name.clone(),
            reason: reason.to_string(),
        };
        if task_type.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if task_type.batch_size == 0 {
            return Err(invalid("batch_size must be positive"));
        }
        if task_type.lock_ttl.is_zero() {
            return Err(invalid("lock_ttl must be positive"));
        }
        if task_type.db_retry == 0 {
            return Err(invalid("db_retry must be at least 1"));
        }
        if let Err(reason) = task_type.poll.validate() {
            return Err(invalid(reason.as_str()));
        }
        if self.task_types.contains_key(&task_type.name) {
            return Err(BuildError::DuplicateTaskType(task_type.name));
        }
        self.task_types
            .insert(task_type.name.clone(), Arc::new(task_type));
        Ok(self)
    }

    /// 期待される task type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_compensator(mut self, config: CompensatorConfig) -> Self {
        self.compensator = Some(config);
        self
    }

    /// # 検証
    /// - expect_tasks() で設定された task type が全て登録されているかチェック
    /// - 不足があれば BuildError::MissingTaskTypes を返す
    pub fn build(self) -> Result<TaskQueue, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !self.task_types.contains_key(*x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        Ok(TaskQueue {
            ctx: self.ctx,
            task_types: self.task_types,
            compensator: self.compensator,
        })
    }
}

/// Validated set of task types bound to one context.
pub struct TaskQueue {
    ctx: QueueContext,
    task_types: BTreeMap<String, Arc<TaskType>>,
    compensator: Option<CompensatorConfig>,
}

impl TaskQueue {
    /// Registered names, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        self.task_types.keys().map(String::as_str).collect()
    }

    /// A standalone worker for `name`, for driving passes by hand.
    pub fn worker(&self, name: &str) -> Option<TaskWorker> {
        self.task_types
            .get(name)
            .map(|task_type| TaskWorker::new(self.ctx.clone(), Arc::clone(task_type)))
    }

    pub fn compensator(&self) -> Option<Compensator> {
        self.compensator
            .clone()
            .map(|config| Compensator::new(self.ctx.clone(), config))
    }

    /// One loop per task type, plus the compensator ticker when configured.
    pub fn start(&self) -> WorkerGroup {
        let task_types: Vec<Arc<TaskType>> = self.task_types.values().cloned().collect();
        let mut group = WorkerGroup::spawn(self.ctx.clone(), &task_types);
        if let Some(compensator) = self.compensator() {
            group.spawn_compensator(compensator);
        }
        tracing::info!(task_types = ?self.task_types(), "task queue started");
        group
    }
}
