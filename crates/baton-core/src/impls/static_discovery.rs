//! Fixed service list with a settable leadership flag.
//!
//! Stands in for `Discovery` where no coordination service is involved:
//! queue-engine tests, and single-node runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::discovery::watcher::rotated;
use crate::domain::errors::DiscoveryError;
use crate::ports::discovery::ServiceDiscovery;

#[derive(Debug, Default)]
pub struct StaticDiscovery {
    master: AtomicBool,
    services: HashMap<String, (Vec<String>, AtomicUsize)>,
}

impl StaticDiscovery {
    pub fn new(master: bool) -> Self {
        Self {
            master: AtomicBool::new(master),
            services: HashMap::new(),
        }
    }

    pub fn with_service(
        mut self,
        service: impl Into<String>,
        urls: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let urls = urls.into_iter().map(Into::into).collect();
        self.services
            .insert(service.into(), (urls, AtomicUsize::new(0)));
        self
    }

    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::SeqCst);
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    fn servers(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
        let (urls, cursor) = self
            .services
            .get(service)
            .ok_or_else(|| DiscoveryError::UnknownService(service.to_string()))?;
        if urls.is_empty() {
            return Err(DiscoveryError::NoServers(service.to_string()));
        }
        Ok(rotated(urls, cursor))
    }
}
