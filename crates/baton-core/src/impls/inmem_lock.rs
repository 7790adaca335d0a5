//! In-memory lock store with clock-driven TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::errors::LockError;
use crate::ports::{Clock, LockStore};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LockState {
    entries: HashMap<String, Entry>,
    unavailable: bool,
    acquisitions: u64,
}

/// Expiry is evaluated against the injected clock, so a `FixedClock`
/// advanced past the TTL frees the key without sleeping.
pub struct InMemoryLockStore {
    state: Arc<Mutex<LockState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState::default())),
            clock,
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Successful `set_if_absent` calls so far.
    pub async fn acquisitions(&self) -> u64 {
        self.state.lock().await.acquisitions
    }

    pub async fn value(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }
}

impl LockState {
    fn check(&self) -> Result<(), LockError> {
        if self.unavailable {
            return Err(LockError::Unavailable("lock store is offline".to_string()));
        }
        Ok(())
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check()?;
        state.purge_expired(now);
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            },
        );
        state.acquisitions += 1;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check()?;
        state.purge_expired(now);
        Ok(state.entries.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check()?;
        state.purge_expired(now);
        Ok(state.entries.remove(key).is_some())
    }
}
