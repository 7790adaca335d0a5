//! Registered server instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A live process registered under a service type.
///
/// Stored as JSON in the instance's ephemeral node; the node disappears
/// with the owning session (crash, shutdown, or partition longer than the
/// session timeout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInstance {
    /// `host:port`
    pub address: String,
    pub scheme: String,
    pub uuid: Uuid,
    pub registered_at: DateTime<Utc>,
}

impl ServerInstance {
    pub fn new(address: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            scheme: scheme.into(),
            uuid: Uuid::new_v4(),
            registered_at: Utc::now(),
        }
    }

    /// Base URL used by dispatchers, e.g. `http://10.0.0.1:8080`.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }

    /// Name of the instance's node under its service path.
    pub fn node_name(&self) -> String {
        self.uuid.to_string()
    }
}
