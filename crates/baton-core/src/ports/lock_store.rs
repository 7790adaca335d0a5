//! LockStore port - タスク単位の分散ロック
//!
//! A Redis-style `SET key value NX EX ttl`. The lock guarding a task is the
//! real mutual-exclusion mechanism; leadership only decides who tries.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::LockError;

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` only if it does not exist. `Ok(false)` means someone else holds it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, LockError>;

    async fn exists(&self, key: &str) -> Result<bool, LockError>;

    /// Returns whether a key was actually removed.
    async fn delete(&self, key: &str) -> Result<bool, LockError>;
}
