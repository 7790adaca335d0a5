//! ServiceDiscovery port - what the queue engine needs from discovery.

use crate::domain::errors::DiscoveryError;

pub trait ServiceDiscovery: Send + Sync {
    /// Advisory leadership flag. Never blocks.
    fn is_master(&self) -> bool;

    /// Base URLs of live instances of `service`, rotated on every call.
    fn servers(&self, service: &str) -> Result<Vec<String>, DiscoveryError>;
}
