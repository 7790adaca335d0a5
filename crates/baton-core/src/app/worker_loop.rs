//! WorkerLoop - タスク実行ループ
//!
//! One loop per task type. A pass (`TaskWorker::run_once`):
//! 1. not leader → nothing
//! 2. fetch up to `batch_size` runnable tasks of this type, oldest first
//! 3. per task: lock → claim (New/WaitExecute → Executing) → sub-tasks in
//!    order → aggregate status + sync history → unlock
//!
//! The lock keeps two workers off the same task; the claim's status guard
//! keeps a stale worker from re-running a task that already moved on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::backoff::PollPolicy;
use crate::app::compensator::Compensator;
use crate::app::context::QueueContext;
use crate::config::TaskTypeConfig;
use crate::domain::errors::{DiscoveryError, DispatchError, StoreError};
use crate::domain::ids::{SubTaskId, TaskId};
use crate::domain::task::{ResponseEnvelope, Task, TaskStatus, task_lock_key};
use crate::ports::dispatch::Route;
use crate::ports::task_store::{FindOptions, SubTaskPatch, TaskFilter, TaskUpdate};

/// Pause between attempts of one task-store write.
const DB_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Runtime settings of one task type.
#[derive(Debug, Clone)]
pub struct TaskType {
    pub name: String,
    pub route: Route,
    /// Retries after the first call of a sub-task.
    pub retry: u32,
    pub retry_interval: Duration,
    /// TTL of the task lock; also the execution deadline of one task.
    pub lock_ttl: Duration,
    pub batch_size: usize,
    /// Attempts per task-store write.
    pub db_retry: u32,
    pub poll: PollPolicy,
}

impl TaskType {
    pub fn from_config(config: &TaskTypeConfig) -> Self {
        Self {
            name: config.name.clone(),
            route: config.route.clone(),
            retry: config.retry,
            retry_interval: config.retry_interval(),
            lock_ttl: config.lock_ttl(),
            batch_size: config.batch_size,
            db_retry: config.db_retry,
            poll: config.poll.policy(),
        }
    }
}

/// What happened to one fetched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed,
    /// Lock held elsewhere, or the claim matched nothing.
    Contended,
    /// A lock or store call kept failing; left for a later pass or the compensator.
    Abandoned,
    /// Execution deadline elapsed. No terminal status was written.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub contended: usize,
    pub abandoned: usize,
    pub cancelled: usize,
    /// The batch stopped early (leadership lost or shutdown).
    pub interrupted: bool,
}

impl PassReport {
    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Succeeded => self.succeeded += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Contended => self.contended += 1,
            ItemOutcome::Abandoned => self.abandoned += 1,
            ItemOutcome::Cancelled => self.cancelled += 1,
        }
    }

    /// Items this pass actually worked on.
    pub fn executed(&self) -> usize {
        self.succeeded + self.failed + self.abandoned + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    NotLeader,
    Idle,
    FetchFailed,
    Processed(PassReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    NotLeader,
    Idle,
    FetchError,
}

/// Which back-off follows a pass. `None` polls again right away.
fn wait_after(outcome: &PassOutcome) -> Option<Wait> {
    match outcome {
        PassOutcome::NotLeader => Some(Wait::NotLeader),
        PassOutcome::Idle => Some(Wait::Idle),
        PassOutcome::FetchFailed => Some(Wait::FetchError),
        // 負荷がある間は待たずに次を取りに行く
        PassOutcome::Processed(report) if report.executed() > 0 => None,
        // 全部ほかのワーカーに取られた
        PassOutcome::Processed(_) => Some(Wait::Idle),
    }
}

/// Executes tasks of one type.
pub struct TaskWorker {
    ctx: QueueContext,
    task_type: Arc<TaskType>,
    shutdown: watch::Receiver<bool>,
}

impl TaskWorker {
    pub fn new(ctx: QueueContext, task_type: Arc<TaskType>) -> Self {
        let (_tx, shutdown) = watch::channel(false);
        Self::with_shutdown(ctx, task_type, shutdown)
    }

    fn with_shutdown(
        ctx: QueueContext,
        task_type: Arc<TaskType>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            task_type,
            shutdown,
        }
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// One poll of the store plus execution of whatever it returned.
    pub async fn run_once(&self) -> PassOutcome {
        let name = &self.task_type.name;
        if !self.ctx.discovery.is_master() {
            debug!(task_type = %name, "not leader, skipping poll");
            return PassOutcome::NotLeader;
        }

        let filter = TaskFilter::new()
            .name(name.clone())
            .statuses(&TaskStatus::RUNNABLE);
        let tasks = match self
            .ctx
            .store
            .find(&filter, FindOptions::oldest(self.task_type.batch_size))
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(task_type = %name, error = %err, "fetching runnable tasks failed");
                return PassOutcome::FetchFailed;
            }
        };
        if tasks.is_empty() {
            return PassOutcome::Idle;
        }

        let mut report = PassReport {
            fetched: tasks.len(),
            ..PassReport::default()
        };
        for task in tasks {
            // アイテムの合間でだけ止まる
            if *self.shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            if !self.ctx.discovery.is_master() {
                info!(task_type = %name, "leadership lost, stopping batch");
                report.interrupted = true;
                break;
            }
            let outcome = self.process(task).await;
            report.record(outcome);
        }
        debug!(task_type = %name, ?report, "pass finished");
        PassOutcome::Processed(report)
    }

    async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        let mut streak: Option<(Wait, u32)> = None;
        info!(task_type = %self.task_type.name, "worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(wait) = wait_after(&self.run_once().await) else {
                streak = None;
                tokio::task::yield_now().await;
                continue;
            };

            let occurrences = match streak {
                Some((previous, n)) if previous == wait => n.saturating_add(1),
                _ => 1,
            };
            streak = Some((wait, occurrences));
            let policy = match wait {
                Wait::NotLeader => self.task_type.poll.not_leader,
                Wait::Idle => self.task_type.poll.idle,
                Wait::FetchError => self.task_type.poll.fetch_error,
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(policy.next_delay(occurrences)) => {}
            }
        }
        info!(task_type = %self.task_type.name, "worker loop stopped");
    }

    async fn process(&self, task: Task) -> ItemOutcome {
        let task_id = task.task_id;
        let key = task_lock_key(task_id);
        let acquired_at = self.ctx.clock.now().to_rfc3339();

        match self
            .ctx
            .locks
            .set_if_absent(&key, &acquired_at, self.task_type.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(%task_id, "task locked by another worker, skipping");
                return ItemOutcome::Contended;
            }
            Err(err) => {
                warn!(%task_id, error = %err, "acquiring task lock failed");
                return ItemOutcome::Abandoned;
            }
        }

        let outcome = match tokio::time::timeout(self.task_type.lock_ttl, self.execute(task)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    %task_id,
                    deadline_secs = self.task_type.lock_ttl.as_secs(),
                    "execution deadline elapsed, abandoning task"
                );
                ItemOutcome::Cancelled
            }
        };

        // 解放はベストエフォート。失敗しても TTL で消える
        if let Err(err) = self.ctx.locks.delete(&key).await {
            warn!(%task_id, error = %err, "releasing task lock failed");
        }
        outcome
    }

    async fn execute(&self, mut task: Task) -> ItemOutcome {
        let task_id = task.task_id;
        let store = &self.ctx.store;

        let claim = TaskFilter::new()
            .task_id(task_id)
            .statuses(&TaskStatus::RUNNABLE);
        let claim_update = TaskUpdate::status(TaskStatus::Executing, self.ctx.clock.now());
        match self
            .with_db_retry("claim task", task_id, || store.update(&claim, &claim_update))
            .await
        {
            Ok(1) => {}
            Ok(matched) => {
                debug!(%task_id, matched, "task is no longer runnable, skipping");
                return ItemOutcome::Contended;
            }
            Err(_) => return ItemOutcome::Abandoned,
        }
        task.status = TaskStatus::Executing;
        info!(%task_id, task_type = %task.name, sub_tasks = task.sub_tasks.len(), "executing task");

        let executing = TaskFilter::new()
            .task_id(task_id)
            .statuses(&[TaskStatus::Executing]);

        for idx in 0..task.sub_tasks.len() {
            let sub = &task.sub_tasks[idx];
            let sub_task_id = sub.sub_task_id;
            let (status, response) = match sub.status {
                TaskStatus::Success => continue,
                TaskStatus::New | TaskStatus::WaitExecute => {
                    match self.call_with_retry(task_id, sub_task_id, &sub.data).await {
                        Ok(envelope) => (TaskStatus::Success, envelope),
                        Err(err) => (
                            TaskStatus::Fail,
                            ResponseEnvelope::failure(err.code(), err.to_string()),
                        ),
                    }
                }
                TaskStatus::Fail => {
                    debug!(%task_id, %sub_task_id, "sub-task already failed");
                    break;
                }
                TaskStatus::Executing => {
                    warn!(%task_id, %sub_task_id, "sub-task in executing state, rejecting");
                    (
                        TaskStatus::Fail,
                        ResponseEnvelope::failure(-1, "sub-task status executing cannot be dispatched"),
                    )
                }
            };

            let patch = TaskUpdate::sub_task(
                SubTaskPatch {
                    sub_task_id,
                    status,
                    response: Some(response.clone()),
                },
                self.ctx.clock.now(),
            );
            match self
                .with_db_retry("persist sub-task", task_id, || {
                    store.update(&executing, &patch)
                })
                .await
            {
                Ok(1) => {}
                Ok(_) => {
                    warn!(%task_id, "task left executing state while running, abandoning");
                    return ItemOutcome::Abandoned;
                }
                Err(_) => return ItemOutcome::Abandoned,
            }

            let sub = &mut task.sub_tasks[idx];
            sub.status = status;
            sub.response = Some(response);
            if status == TaskStatus::Fail {
                break;
            }
        }

        let final_status = task.aggregate_status();
        if !final_status.is_terminal() {
            warn!(%task_id, status = ?final_status, "task did not reach a terminal status");
            return ItemOutcome::Abandoned;
        }

        let finish = TaskUpdate::status(final_status, self.ctx.clock.now());
        match self
            .with_db_retry("persist task status", task_id, || {
                store.update(&executing, &finish)
            })
            .await
        {
            Ok(1) => {}
            Ok(_) => {
                warn!(%task_id, "task left executing state before completion was written");
                return ItemOutcome::Abandoned;
            }
            Err(_) => return ItemOutcome::Abandoned,
        }

        let history = TaskFilter::new().task_id(task_id);
        // 履歴の更新失敗はタスク結果に影響させない (ログは with_db_retry 側で出る)
        let _ = self
            .with_db_retry("update sync history", task_id, || {
                store.update_history(&history, &finish)
            })
            .await;

        info!(%task_id, status = ?final_status, "task finished");
        if final_status == TaskStatus::Success {
            ItemOutcome::Succeeded
        } else {
            ItemOutcome::Failed
        }
    }

    /// 1 + `retry` attempts, each against the next instance in rotation.
    async fn call_with_retry(
        &self,
        task_id: TaskId,
        sub_task_id: SubTaskId,
        body: &serde_json::Value,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let route = &self.task_type.route;
        let attempts = self.task_type.retry.saturating_add(1);
        let mut attempt = 1;
        loop {
            let result = match self.ctx.discovery.servers(&route.service) {
                Ok(servers) => match servers.first() {
                    Some(base_url) => self.ctx.dispatcher.dispatch(base_url, route, body).await,
                    None => Err(DiscoveryError::NoServers(route.service.clone()).into()),
                },
                Err(err) => Err(err.into()),
            };

            match result {
                Ok(envelope) => return Ok(envelope),
                Err(err) if attempt < attempts => {
                    warn!(%task_id, %sub_task_id, attempt, attempts, error = %err, "sub-task call failed, retrying");
                    if !self.task_type.retry_interval.is_zero() {
                        tokio::time::sleep(self.task_type.retry_interval).await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    warn!(%task_id, %sub_task_id, attempts, error = %err, "sub-task failed");
                    return Err(err);
                }
            }
        }
    }

    async fn with_db_retry<T, F, Fut>(
        &self,
        op: &'static str,
        task_id: TaskId,
        mut write: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.task_type.db_retry.max(1);
        let mut attempt = 1;
        loop {
            match write().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    warn!(%task_id, op, attempt, attempts, error = %err, "task store write failed, retrying");
                    tokio::time::sleep(DB_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(%task_id, op, attempts, error = %err, "task store write failed, leaving task for a later pass");
                    return Err(err);
                }
            }
        }
    }
}

/// Worker group handle.
/// - `request_shutdown()` で全ループに停止を通知（実行中のタスクは最後まで走る）
/// - `shutdown_and_join()` で全ループの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn one loop per task type.
    pub fn spawn(ctx: QueueContext, task_types: &[Arc<TaskType>]) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::with_capacity(task_types.len() + 1);
        for task_type in task_types {
            let worker =
                TaskWorker::with_shutdown(ctx.clone(), Arc::clone(task_type), shutdown_rx.clone());
            joins.push(tokio::spawn(worker.run()));
        }
        Self { shutdown_tx, joins }
    }

    /// Run `compensator` on its own ticker, stopped together with the workers.
    pub fn spawn_compensator(&mut self, compensator: Compensator) {
        let shutdown = self.shutdown_tx.subscribe();
        self.joins.push(tokio::spawn(compensator.run(shutdown)));
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testkit::{Fixture, SERVICE, fast_task_type, leading_discovery};
    use crate::impls::StubDispatcher;
    use crate::ports::{LockStore, TaskStore};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker(fx: &Fixture) -> TaskWorker {
        TaskWorker::new(fx.context(), Arc::new(fast_task_type()))
    }

    fn step_of(body: &serde_json::Value) -> u64 {
        body["step"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn all_sub_tasks_succeed() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(TaskStatus::New, &[TaskStatus::New, TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        fx.store
            .insert_history(vec![crate::domain::task::SyncHistory::for_task(&task)])
            .await
            .unwrap();

        let outcome = worker(&fx).run_once().await;

        let PassOutcome::Processed(report) = outcome else {
            panic!("expected a processed pass, got {outcome:?}");
        };
        assert_eq!(report.succeeded, 1);

        let stored = fx.stored(task.task_id).await;
        assert_eq!(stored.status, TaskStatus::Success);
        assert!(stored.sub_tasks.iter().all(|s| s.status == TaskStatus::Success));
        assert!(stored.sub_tasks.iter().all(|s| s.response.is_some()));
        assert_eq!(
            fx.store.history(task.task_id).await.unwrap().status,
            TaskStatus::Success
        );
        assert_eq!(fx.dispatcher.call_count(), 2);
        assert!(!fx.locks.exists(&task_lock_key(task.task_id)).await.unwrap());
    }

    #[tokio::test]
    async fn failing_sub_task_fails_the_task_and_is_not_rerun() {
        let fx = Fixture::new(StubDispatcher::new(|_, body| {
            if step_of(body) == 1 {
                Err(DispatchError::Rejected {
                    code: 1199014,
                    message: "host not found".to_string(),
                })
            } else {
                Ok(ResponseEnvelope::success(serde_json::Value::Null))
            }
        }));
        let task = fx.task(TaskStatus::New, &[TaskStatus::New, TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        let worker = worker(&fx);

        worker.run_once().await;

        let stored = fx.stored(task.task_id).await;
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(stored.sub_tasks[0].status, TaskStatus::Success);
        assert_eq!(stored.sub_tasks[1].status, TaskStatus::Fail);
        let response = stored.sub_tasks[1].response.as_ref().unwrap();
        assert!(!response.result);
        assert_eq!(response.code, 1199014);
        // 1 call for S1, 1 + retry(2) for S2
        assert_eq!(fx.dispatcher.call_count(), 4);

        assert_eq!(worker.run_once().await, PassOutcome::Idle);
        assert_eq!(fx.dispatcher.call_count(), 4);
    }

    #[tokio::test]
    async fn replay_runs_only_unfinished_sub_tasks() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(
            TaskStatus::WaitExecute,
            &[TaskStatus::Success, TaskStatus::Success, TaskStatus::New],
        );
        fx.store.insert(vec![task.clone()]).await.unwrap();

        worker(&fx).run_once().await;

        let calls = fx.dispatcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(step_of(&calls[0].body), 2);

        let stored = fx.stored(task.task_id).await;
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.sub_tasks[0], task.sub_tasks[0]);
        assert_eq!(stored.sub_tasks[1], task.sub_tasks[1]);
    }

    #[tokio::test]
    async fn non_leader_never_locks_or_mutates() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        fx.discovery.set_master(false);
        let tasks: Vec<Task> = (0..50)
            .map(|_| fx.task(TaskStatus::New, &[TaskStatus::New]))
            .collect();
        fx.store.insert(tasks.clone()).await.unwrap();
        let writes_before = fx.store.write_calls().await;

        assert_eq!(worker(&fx).run_once().await, PassOutcome::NotLeader);

        assert_eq!(fx.locks.acquisitions().await, 0);
        assert_eq!(fx.store.write_calls().await, writes_before);
        assert_eq!(fx.dispatcher.call_count(), 0);
        for task in tasks {
            assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::New);
        }
    }

    #[tokio::test]
    async fn unreachable_store_is_a_fetch_failure() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        fx.store.set_unavailable(true).await;

        assert_eq!(worker(&fx).run_once().await, PassOutcome::FetchFailed);
        assert_eq!(fx.locks.acquisitions().await, 0);
        assert_eq!(fx.dispatcher.call_count(), 0);

        fx.store.set_unavailable(false).await;
        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::New);
    }

    #[tokio::test]
    async fn executing_sub_task_is_failed_without_dispatch() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(
            TaskStatus::WaitExecute,
            &[TaskStatus::Executing, TaskStatus::New],
        );
        fx.store.insert(vec![task.clone()]).await.unwrap();

        let outcome = worker(&fx).run_once().await;

        assert!(matches!(outcome, PassOutcome::Processed(r) if r.failed == 1));
        let stored = fx.stored(task.task_id).await;
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(stored.sub_tasks[0].status, TaskStatus::Fail);
        assert_eq!(stored.sub_tasks[0].response.as_ref().unwrap().code, -1);
        assert_eq!(stored.sub_tasks[1].status, TaskStatus::New);
        assert!(stored.sub_tasks[1].response.is_none());
        assert_eq!(fx.dispatcher.call_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_lock_store_abandons_without_claiming() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        fx.locks.set_unavailable(true).await;

        let outcome = worker(&fx).run_once().await;

        assert!(matches!(outcome, PassOutcome::Processed(r) if r.abandoned == 1));
        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::New);
        assert_eq!(fx.dispatcher.call_count(), 0);
    }

    #[rstest]
    #[case::not_leader(PassOutcome::NotLeader, Some(Wait::NotLeader))]
    #[case::idle(PassOutcome::Idle, Some(Wait::Idle))]
    #[case::fetch_failed(PassOutcome::FetchFailed, Some(Wait::FetchError))]
    #[case::all_contended(
        PassOutcome::Processed(PassReport { fetched: 2, contended: 2, ..PassReport::default() }),
        Some(Wait::Idle)
    )]
    #[case::worked(
        PassOutcome::Processed(PassReport { fetched: 2, succeeded: 1, contended: 1, ..PassReport::default() }),
        None
    )]
    #[case::cancelled_counts_as_work(
        PassOutcome::Processed(PassReport { fetched: 1, cancelled: 1, ..PassReport::default() }),
        None
    )]
    fn back_off_follows_the_pass(#[case] outcome: PassOutcome, #[case] expected: Option<Wait>) {
        assert_eq!(wait_after(&outcome), expected);
    }

    #[tokio::test]
    async fn racing_workers_execute_a_task_once() {
        let fx = Fixture::new(
            StubDispatcher::always_ok().with_latency(Duration::from_millis(30)),
        );
        let task = fx.task(TaskStatus::New, &[TaskStatus::New, TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();

        let a = worker(&fx);
        let b = worker(&fx);
        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());

        let succeeded = [ra, rb]
            .iter()
            .filter(|o| matches!(o, PassOutcome::Processed(r) if r.succeeded == 1))
            .count();
        assert_eq!(succeeded, 1);
        assert_eq!(fx.dispatcher.call_count(), 2);
        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn held_lock_is_skipped_without_side_effects() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        fx.locks
            .set_if_absent(
                &task_lock_key(task.task_id),
                "other-node",
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        let outcome = worker(&fx).run_once().await;

        assert!(matches!(outcome, PassOutcome::Processed(r) if r.contended == 1));
        assert_eq!(fx.dispatcher.call_count(), 0);
        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::New);
        assert_eq!(
            fx.locks.value(&task_lock_key(task.task_id)).await.as_deref(),
            Some("other-node")
        );
    }

    #[tokio::test]
    async fn leadership_loss_stops_the_batch() {
        let discovery = Arc::new(leading_discovery());
        let flip = Arc::clone(&discovery);
        let fx = Fixture::with_discovery(
            StubDispatcher::new(move |_, _| {
                flip.set_master(false);
                Ok(ResponseEnvelope::success(serde_json::Value::Null))
            }),
            discovery,
        );
        let first = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.clock.advance(chrono::Duration::seconds(1));
        let second = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store
            .insert(vec![first.clone(), second.clone()])
            .await
            .unwrap();

        let outcome = worker(&fx).run_once().await;

        let PassOutcome::Processed(report) = outcome else {
            panic!("expected a processed pass");
        };
        assert!(report.interrupted);
        assert_eq!(report.succeeded, 1);
        assert_eq!(fx.stored(first.task_id).await.status, TaskStatus::Success);
        assert_eq!(fx.stored(second.task_id).await.status, TaskStatus::New);
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        fx.store.fail_next_writes(2).await;

        worker(&fx).run_once().await;

        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn persistent_store_failure_abandons_the_task_for_this_pass() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        fx.store.fail_next_writes(3).await;
        let worker = worker(&fx);

        let outcome = worker.run_once().await;

        assert!(matches!(outcome, PassOutcome::Processed(r) if r.abandoned == 1));
        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::New);
        assert!(!fx.locks.exists(&task_lock_key(task.task_id)).await.unwrap());
        assert_eq!(fx.dispatcher.call_count(), 0);

        worker.run_once().await;
        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn deadline_cancels_without_marking_failure() {
        let fx = Fixture::new(
            StubDispatcher::always_ok().with_latency(Duration::from_millis(500)),
        );
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();
        let mut task_type = fast_task_type();
        task_type.lock_ttl = Duration::from_millis(50);
        let worker = TaskWorker::new(fx.context(), Arc::new(task_type));

        let outcome = worker.run_once().await;

        assert!(matches!(outcome, PassOutcome::Processed(r) if r.cancelled == 1));
        let stored = fx.stored(task.task_id).await;
        assert_eq!(stored.status, TaskStatus::Executing);
        assert_eq!(stored.sub_tasks[0].status, TaskStatus::New);
        assert!(stored.sub_tasks[0].response.is_none());
        assert!(!fx.locks.exists(&task_lock_key(task.task_id)).await.unwrap());
    }

    #[tokio::test]
    async fn missing_instances_fail_the_sub_task() {
        let discovery = Arc::new(crate::impls::StaticDiscovery::new(true).with_service(
            SERVICE,
            Vec::<String>::new(),
        ));
        let fx = Fixture::with_discovery(StubDispatcher::always_ok(), discovery);
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();

        worker(&fx).run_once().await;

        let stored = fx.stored(task.task_id).await;
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(stored.sub_tasks[0].response.as_ref().unwrap().code, -1);
    }

    #[tokio::test]
    async fn retries_rotate_across_instances() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let fx = Fixture::new(StubDispatcher::new(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DispatchError::Transport("connection refused".to_string()))
            } else {
                Ok(ResponseEnvelope::success(serde_json::Value::Null))
            }
        }));
        let task = fx.task(TaskStatus::New, &[TaskStatus::New]);
        fx.store.insert(vec![task.clone()]).await.unwrap();

        worker(&fx).run_once().await;

        let calls = fx.dispatcher.calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].url, calls[1].url);
        assert_eq!(fx.stored(task.task_id).await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn worker_group_drains_and_stops() {
        let fx = Fixture::new(StubDispatcher::always_ok());
        let tasks: Vec<Task> = (0..5)
            .map(|_| fx.task(TaskStatus::New, &[TaskStatus::New]))
            .collect();
        fx.store.insert(tasks.clone()).await.unwrap();

        let group = WorkerGroup::spawn(fx.context(), &[Arc::new(fast_task_type())]);
        assert_eq!(group.len(), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let done = fx
                    .store
                    .count(&TaskFilter::new().statuses(&[TaskStatus::Success]))
                    .await
                    .unwrap();
                if done == 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), group.shutdown_and_join())
            .await
            .unwrap();
    }
}
