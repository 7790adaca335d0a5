//! IdGenerator port.
//!
//! Task ids are generated client side, before the task is inserted, so
//! producers can refer to a task immediately.

use crate::domain::ids::{SubTaskId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_sub_task_id(&self) -> SubTaskId;
}

/// ULID generator whose timestamp part comes from a `Clock`.
///
/// With a `FixedClock` the ids keep a deterministic timestamp while the
/// random part still makes them unique.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_sub_task_id(&self) -> SubTaskId {
        SubTaskId::from(self.next_ulid())
    }
}
