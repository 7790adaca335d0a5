//! Error types, one enum per port plus the producer-facing `TaskError`.
//!
//! The classification follows how callers react:
//! - coordination errors are retried forever by the discovery loops;
//! - contention (lock held, zero matched rows) is not an error at all and
//!   never shows up here;
//! - dispatch errors become a persisted `Fail`;
//! - store errors are retried a bounded number of times, then the item is
//!   left for the next poll or the compensator.

use thiserror::Error;

use super::ids::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error("no such node: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("session expired")]
    SessionExpired,

    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// Errors that mean "the path is not there", as opposed to a broken link.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("no server instance available for service '{0}'")]
    NoServers(String),

    #[error("service '{0}' is not watched by this discovery")]
    UnknownService(String),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("encode server instance: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("task store write failed: {0}")]
    Write(String),

    #[error("duplicate task id {0}")]
    Duplicate(TaskId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Request never produced a response (connect error, per-call timeout, ...).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("downstream returned http status {0}")]
    Status(u16),

    /// Downstream answered with `result: false`.
    #[error("downstream rejected sub-task: code={code} message={message}")]
    Rejected { code: i64, message: String },

    #[error("decode downstream response: {0}")]
    Decode(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl DispatchError {
    /// Code stored in the response envelope of a failed sub-task.
    pub fn code(&self) -> i64 {
        match self {
            DispatchError::Rejected { code, .. } => *code,
            DispatchError::Status(status) => i64::from(*status),
            _ => -1,
        }
    }
}

/// Errors surfaced to task producers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("parameter '{0}' must be set")]
    MissingParameter(&'static str),

    #[error("an unfinished task already exists for instance {0:?}")]
    Conflict(Vec<i64>),

    #[error("delete condition must not be empty")]
    EmptyCondition,

    #[error(transparent)]
    Store(#[from] StoreError),
}
