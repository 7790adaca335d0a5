//! Discovery - サービスレジストリとリーダー選出のファサード
//!
//! `Discovery::start` spawns one `RegistryWatcher` per configured service
//! type plus the `LeaderElector`, all on the same coordination client.
//!
//! Path layout under the configured root:
//! - `<root>/services/<service>/<instance uuid>` (ephemeral, JSON `ServerInstance`)
//! - `<root>/election/master` (held by the current leader)

pub mod election;
mod registration;
pub mod watcher;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::BatonConfig;
use crate::domain::errors::DiscoveryError;
use crate::domain::instance::ServerInstance;
use crate::ports::coordination::CoordinationClient;
use crate::ports::discovery::ServiceDiscovery;

use self::registration::RegistrationKeeper;

pub use self::election::{LeaderElector, LeaderState};
pub use self::watcher::{RegistryWatcher, WatchBackoff};

pub fn services_path(root: &str, service: &str) -> String {
    format!("{}/services/{service}", root.trim_end_matches('/'))
}

pub fn election_path(root: &str) -> String {
    format!("{}/election/master", root.trim_end_matches('/'))
}

pub struct Discovery {
    client: Arc<dyn CoordinationClient>,
    root_path: String,
    watchers: HashMap<String, RegistryWatcher>,
    elector: LeaderElector,
    backoff: WatchBackoff,
    shutdown_tx: watch::Sender<bool>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Discovery {
    /// Watch every service type in `config.discovery.services` and campaign
    /// for leadership as `identity`.
    pub fn start(
        client: Arc<dyn CoordinationClient>,
        config: &BatonConfig,
        identity: impl Into<String>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = WatchBackoff {
            no_node: config.discovery.no_node_backoff(),
            error: config.discovery.error_backoff(),
        };

        let mut joins = Vec::with_capacity(config.discovery.services.len() + 1);
        let mut watchers = HashMap::new();
        for service in &config.discovery.services {
            let (watcher, join) = RegistryWatcher::spawn(
                Arc::clone(&client),
                service.clone(),
                services_path(&config.root_path, service),
                backoff,
                shutdown_rx.clone(),
            );
            watchers.insert(service.clone(), watcher);
            joins.push(join);
        }

        let (elector, join) = LeaderElector::spawn(
            Arc::clone(&client),
            election_path(&config.root_path),
            identity,
            config.discovery.election_retry(),
            shutdown_rx,
        );
        joins.push(join);

        info!(
            root = %config.root_path,
            services = ?config.discovery.services,
            "discovery started"
        );

        Self {
            client,
            root_path: config.root_path.clone(),
            watchers,
            elector,
            backoff,
            shutdown_tx,
            joins: Mutex::new(joins),
        }
    }

    fn watcher(&self, service: &str) -> Result<&RegistryWatcher, DiscoveryError> {
        self.watchers
            .get(service)
            .ok_or_else(|| DiscoveryError::UnknownService(service.to_string()))
    }

    pub fn servers(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
        self.watcher(service)?.servers()
    }

    pub fn subscribe(
        &self,
        service: &str,
    ) -> Result<watch::Receiver<Vec<String>>, DiscoveryError> {
        Ok(self.watcher(service)?.subscribe())
    }

    pub fn is_master(&self) -> bool {
        self.elector.is_master()
    }

    pub fn leader_state(&self) -> LeaderState {
        self.elector.state()
    }

    pub fn subscribe_leader(&self) -> watch::Receiver<LeaderState> {
        self.elector.subscribe()
    }

    /// Publish this process as an instance of `service`. Returns the node path.
    ///
    /// The node is ephemeral. A keeper loop creates it again after a
    /// deletion or session expiry, and removes it on `shutdown`.
    pub async fn register_self(
        &self,
        service: &str,
        instance: &ServerInstance,
    ) -> Result<String, DiscoveryError> {
        let path = format!(
            "{}/{}",
            services_path(&self.root_path, service),
            instance.node_name()
        );
        let data =
            serde_json::to_vec(instance).map_err(|e| DiscoveryError::Encode(e.to_string()))?;
        self.client.create_ephemeral(&path, data.clone()).await?;
        info!(service, node = %path, address = %instance.address, "registered server instance");

        let join = RegistrationKeeper::spawn(
            Arc::clone(&self.client),
            path.clone(),
            data,
            self.backoff.error,
            self.shutdown_tx.subscribe(),
        );
        self.joins.lock().await.push(join);
        Ok(path)
    }

    /// Stop every loop and wait for them. Leadership is resigned on the way out.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let joins = std::mem::take(&mut *self.joins.lock().await);
        for join in joins {
            let _ = join.await;
        }
        info!("discovery stopped");
    }
}

impl ServiceDiscovery for Discovery {
    fn is_master(&self) -> bool {
        Discovery::is_master(self)
    }

    fn servers(&self, service: &str) -> Result<Vec<String>, DiscoveryError> {
        Discovery::servers(self, service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::impls::InMemoryCoordinator;
    use std::time::Duration;

    fn config() -> BatonConfig {
        BatonConfig {
            discovery: DiscoveryConfig {
                services: vec!["host".to_string()],
                no_node_backoff_ms: 10,
                error_backoff_ms: 10,
                election_retry_ms: 10,
            },
            ..BatonConfig::default()
        }
    }

    #[test]
    fn paths_follow_the_root() {
        assert_eq!(services_path("/baton", "host"), "/baton/services/host");
        assert_eq!(services_path("/baton/", "host"), "/baton/services/host");
        assert_eq!(election_path("/baton"), "/baton/election/master");
    }

    #[tokio::test]
    async fn registered_instance_becomes_visible() {
        let coordinator = InMemoryCoordinator::new();
        let discovery = Discovery::start(Arc::new(coordinator.connect().await), &config(), "n1");

        let instance = ServerInstance::new("10.0.0.1:8080", "http");
        let path = discovery.register_self("host", &instance).await.unwrap();
        assert_eq!(
            path,
            format!("/baton/services/host/{}", instance.node_name())
        );

        let mut rx = discovery.subscribe("host").unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|l| !l.is_empty()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            discovery.servers("host").unwrap(),
            vec!["http://10.0.0.1:8080".to_string()]
        );

        let mut leader = discovery.subscribe_leader();
        tokio::time::timeout(Duration::from_secs(2), leader.wait_for(|s| s.is_leader))
            .await
            .unwrap()
            .unwrap();
        assert!(ServiceDiscovery::is_master(&discovery));

        discovery.shutdown().await;
        assert!(!discovery.is_master());
    }

    #[tokio::test]
    async fn registration_survives_session_expiry() {
        let coordinator = InMemoryCoordinator::new();
        let session = coordinator.connect().await;
        let discovery = Discovery::start(Arc::new(session.clone()), &config(), "n1");
        let instance = ServerInstance::new("10.0.0.1:8080", "http");
        let path = discovery.register_self("host", &instance).await.unwrap();
        let mut rx = discovery.subscribe("host").unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|l| !l.is_empty()))
            .await
            .unwrap()
            .unwrap();

        session.expire().await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !coordinator.exists(&path).await || discovery.servers("host").is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("instance was not re-registered");
        assert_eq!(
            discovery.servers("host").unwrap(),
            vec!["http://10.0.0.1:8080".to_string()]
        );

        discovery.shutdown().await;
        assert!(!coordinator.exists(&path).await);
    }

    #[tokio::test]
    async fn unknown_service_is_an_error() {
        let coordinator = InMemoryCoordinator::new();
        let discovery = Discovery::start(Arc::new(coordinator.connect().await), &config(), "n1");
        assert_eq!(
            discovery.servers("process"),
            Err(DiscoveryError::UnknownService("process".to_string()))
        );
        assert!(discovery.subscribe("process").is_err());
        discovery.shutdown().await;
    }
}
