//! Compensator - 孤児タスクの回収
//!
//! A worker that crashes mid-task leaves the task in `Executing` with no
//! lock. While leading, the compensator periodically moves such tasks back
//! to `WaitExecute` so a worker loop picks them up again.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::context::QueueContext;
use crate::config::CompensatorConfig;
use crate::domain::task::{TaskStatus, task_lock_key};
use crate::ports::task_store::{FindOptions, TaskFilter, TaskUpdate};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub scanned: usize,
    pub requeued: usize,
    pub still_locked: usize,
    pub failed: usize,
}

pub struct Compensator {
    ctx: QueueContext,
    config: CompensatorConfig,
}

impl Compensator {
    pub fn new(ctx: QueueContext, config: CompensatorConfig) -> Self {
        Self { ctx, config }
    }

    /// One sweep. `None` when this node is not the leader.
    pub async fn run_once(&self) -> Option<CompensationReport> {
        if !self.ctx.discovery.is_master() {
            debug!("not leader, skipping compensation");
            return None;
        }

        let mut report = CompensationReport::default();
        let Some(threshold) = self
            .ctx
            .clock
            .now()
            .checked_sub_signed(self.config.stale_after())
        else {
            return Some(report);
        };

        let stale = TaskFilter::new()
            .statuses(&[TaskStatus::Executing])
            .last_time_before(threshold);
        let tasks = match self
            .ctx
            .store
            .find(&stale, FindOptions::oldest(self.config.scan_limit))
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "scanning executing tasks failed");
                report.failed += 1;
                return Some(report);
            }
        };
        report.scanned = tasks.len();

        for task in tasks {
            let task_id = task.task_id;
            match self.ctx.locks.exists(&task_lock_key(task_id)).await {
                Ok(true) => {
                    // まだ誰かが実行中
                    report.still_locked += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(%task_id, error = %err, "checking task lock failed");
                    report.failed += 1;
                    continue;
                }
            }

            let guard = TaskFilter::new()
                .task_id(task_id)
                .statuses(&[TaskStatus::Executing])
                .last_time_before(threshold);
            let requeue = TaskUpdate::status(TaskStatus::WaitExecute, self.ctx.clock.now());
            match self.ctx.store.update(&guard, &requeue).await {
                Ok(1) => {}
                Ok(_) => {
                    debug!(%task_id, "task moved on before it could be requeued");
                    continue;
                }
                Err(err) => {
                    warn!(%task_id, error = %err, "requeueing orphaned task failed");
                    report.failed += 1;
                    continue;
                }
            }
            report.requeued += 1;
            info!(%task_id, task_type = %task.name, "requeued orphaned task");

            if let Err(err) = self
                .ctx
                .store
                .update_history(&TaskFilter::new().task_id(task_id), &requeue)
                .await
            {
                warn!(%task_id, error = %err, "updating sync history failed");
            }
        }

        Some(report)
    }

    /// Sweep every `interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // interval() は 0 を受け付けない
        let period = self.config.interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_secs, "compensator started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(report) = self.run_once().await
                        && report.scanned > 0
                    {
                        info!(?report, "compensation sweep finished");
                    }
                }
            }
        }
        info!("compensator stopped");
    }
}
