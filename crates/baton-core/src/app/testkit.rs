//! Shared fixtures for app-level tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::app::backoff::{BackoffPolicy, PollPolicy};
use crate::app::context::QueueContext;
use crate::app::worker_loop::TaskType;
use crate::domain::ids::TaskId;
use crate::domain::task::{SubTask, Task, TaskStatus};
use crate::impls::{InMemoryLockStore, InMemoryTaskStore, StaticDiscovery, StubDispatcher};
use crate::ports::dispatch::{HttpMethod, Route};
use crate::ports::{Clock, FixedClock, IdGenerator, UlidGenerator};

pub const TASK_NAME: &str = "sync_host";
pub const SERVICE: &str = "host";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// Leader with two `host` instances.
pub fn leading_discovery() -> StaticDiscovery {
    StaticDiscovery::new(true).with_service(SERVICE, ["http://10.0.0.1:80", "http://10.0.0.2:80"])
}

pub struct Fixture {
    pub clock: FixedClock,
    pub store: Arc<InMemoryTaskStore>,
    pub locks: Arc<InMemoryLockStore>,
    pub discovery: Arc<StaticDiscovery>,
    pub dispatcher: StubDispatcher,
    pub ids: UlidGenerator<FixedClock>,
}

impl Fixture {
    pub fn new(dispatcher: StubDispatcher) -> Self {
        Self::with_discovery(dispatcher, Arc::new(leading_discovery()))
    }

    pub fn with_discovery(dispatcher: StubDispatcher, discovery: Arc<StaticDiscovery>) -> Self {
        let clock = FixedClock::new(t0());
        Self {
            store: Arc::new(InMemoryTaskStore::new()),
            locks: Arc::new(InMemoryLockStore::new(Arc::new(clock.clone()))),
            discovery,
            dispatcher,
            ids: UlidGenerator::new(clock.clone()),
            clock,
        }
    }

    pub fn context(&self) -> QueueContext {
        QueueContext::new(
            self.discovery.clone(),
            self.store.clone(),
            self.locks.clone(),
            Arc::new(self.dispatcher.clone()),
            Arc::new(self.clock.clone()),
        )
    }

    /// Task with one sub-task per `statuses` entry, each carrying `{"step": i}`.
    pub fn task(&self, status: TaskStatus, statuses: &[TaskStatus]) -> Task {
        let now = self.clock.now();
        Task {
            task_id: self.ids.generate_task_id(),
            name: TASK_NAME.to_string(),
            inst_id: 7,
            user: "admin".to_string(),
            extra: None,
            sub_tasks: statuses
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let mut sub =
                        SubTask::new(self.ids.generate_sub_task_id(), serde_json::json!({"step": i}));
                    sub.status = *s;
                    sub
                })
                .collect(),
            status,
            create_time: now,
            last_time: now,
        }
    }

    pub async fn stored(&self, task_id: TaskId) -> Task {
        self.store.get(task_id).await.expect("task not in store")
    }
}

/// Route to `host` with no waiting between retries or polls.
pub fn fast_task_type() -> TaskType {
    TaskType {
        name: TASK_NAME.to_string(),
        route: Route::new(SERVICE, HttpMethod::Post, "/sync/host"),
        retry: 2,
        retry_interval: Duration::ZERO,
        lock_ttl: Duration::from_secs(600),
        batch_size: 20,
        db_retry: 3,
        poll: PollPolicy {
            not_leader: BackoffPolicy::fixed(Duration::from_millis(5)),
            idle: BackoffPolicy::fixed(Duration::from_millis(5)),
            fetch_error: BackoffPolicy::fixed(Duration::from_millis(5)),
        },
    }
}
