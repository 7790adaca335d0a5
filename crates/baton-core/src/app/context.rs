//! QueueContext - ワーカーループに渡す依存一式

use std::sync::Arc;

use crate::ports::{Clock, Dispatcher, LockStore, ServiceDiscovery, TaskStore};

/// Everything a worker loop or the compensator talks to.
///
/// Built once at start-up and cloned into every loop.
#[derive(Clone)]
pub struct QueueContext {
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub store: Arc<dyn TaskStore>,
    pub locks: Arc<dyn LockStore>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub clock: Arc<dyn Clock>,
}

impl QueueContext {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        store: Arc<dyn TaskStore>,
        locks: Arc<dyn LockStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            discovery,
            store,
            locks,
            dispatcher,
            clock,
        }
    }
}
