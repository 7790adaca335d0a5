//! Domain model (ids, tasks, server instances, errors).

pub mod errors;
pub mod ids;
pub mod instance;
pub mod task;

pub use errors::{
    CoordinationError, DiscoveryError, DispatchError, LockError, StoreError, TaskError,
};
pub use ids::{SubTaskId, TaskId};
pub use instance::ServerInstance;
pub use task::{ResponseEnvelope, SubTask, SyncHistory, Task, TaskStatus, task_lock_key};
