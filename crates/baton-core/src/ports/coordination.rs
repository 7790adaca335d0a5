//! CoordinationClient port - ZooKeeper/etcd 相当の協調サービス
//!
//! Hierarchical paths, ephemeral nodes bound to the client session, one-shot
//! watches and a blocking campaign primitive. Discovery and leader election
//! are built only on these calls.

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::domain::errors::CoordinationError;

/// What fired a one-shot watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    ChildrenChanged,
    NodeDeleted,
    /// The session that registered the watch ended; the watch will not fire again.
    SessionExpired,
}

/// Children of a path plus the watch registered atomically with the read.
#[derive(Debug)]
pub struct ChildrenWatch {
    pub children: Vec<String>,
    pub event: oneshot::Receiver<WatchEvent>,
}

/// Value of a node plus the watch registered atomically with the read.
#[derive(Debug)]
pub struct ValueWatch {
    pub value: Vec<u8>,
    pub event: oneshot::Receiver<WatchEvent>,
}

/// Ownership of an election path, granted by `campaign`.
///
/// Dropping the handle resigns.
#[derive(Debug)]
pub struct Leadership {
    term: u64,
    revoked: watch::Receiver<bool>,
    _release: Option<oneshot::Sender<()>>,
}

impl Leadership {
    /// `revoked` flips to `true` when the backend takes leadership away.
    /// `release` (if any) is dropped together with the handle so the backend
    /// can observe resignation.
    pub fn new(
        term: u64,
        revoked: watch::Receiver<bool>,
        release: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            term,
            revoked,
            _release: release,
        }
    }

    /// Monotonic grant number assigned by the backend.
    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Resolves once leadership is gone (revoked, or the backend went away).
    pub async fn lost(&mut self) {
        // sender が drop された場合もリーダーではなくなったとみなす
        let _ = self.revoked.wait_for(|revoked| *revoked).await;
    }
}

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create a node that lives as long as this client's session.
    /// Missing parents are created as persistent nodes.
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError>;

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    async fn watch_children(&self, path: &str) -> Result<ChildrenWatch, CoordinationError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordinationError>;

    async fn watch_value(&self, path: &str) -> Result<ValueWatch, CoordinationError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    /// Block until this session owns `path`, then publish `value` there.
    async fn campaign(&self, path: &str, value: Vec<u8>) -> Result<Leadership, CoordinationError>;
}
