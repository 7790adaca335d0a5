//! RegistryWatcher - サービス種別ごとのインスタンス一覧を追跡する
//!
//! One background loop per service type keeps a snapshot of the live
//! instances in a `tokio::sync::watch` channel. Readers never block on the
//! coordination service; they see the latest snapshot, which may lag the
//! backend by one watch round trip.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::DiscoveryError;
use crate::domain::instance::ServerInstance;
use crate::ports::coordination::{ChildrenWatch, CoordinationClient, WatchEvent};

/// Copy of `list` rotated so it starts one position after the previous call.
pub(crate) fn rotated(list: &[String], cursor: &AtomicUsize) -> Vec<String> {
    if list.is_empty() {
        return Vec::new();
    }
    let start = cursor.fetch_add(1, Ordering::Relaxed) % list.len();
    let mut out = Vec::with_capacity(list.len());
    out.extend_from_slice(&list[start..]);
    out.extend_from_slice(&list[..start]);
    out
}

/// Back-off delays of the watch loop.
#[derive(Debug, Clone, Copy)]
pub struct WatchBackoff {
    /// Service path missing.
    pub no_node: Duration,
    /// Connection or session trouble.
    pub error: Duration,
}

/// Read side of one service type's registry.
pub struct RegistryWatcher {
    service: String,
    snapshot: watch::Receiver<Vec<String>>,
    cursor: AtomicUsize,
}

impl RegistryWatcher {
    /// Start watching `path` (the service's directory node).
    pub fn spawn(
        client: Arc<dyn CoordinationClient>,
        service: impl Into<String>,
        path: impl Into<String>,
        backoff: WatchBackoff,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let service = service.into();
        let (tx, rx) = watch::channel(Vec::new());
        let watch_loop = WatchLoop {
            client,
            service: service.clone(),
            path: path.into(),
            backoff,
            known: HashSet::new(),
            tx,
        };
        let join = tokio::spawn(watch_loop.run(shutdown));
        let watcher = Self {
            service,
            snapshot: rx,
            cursor: AtomicUsize::new(0),
        };
        (watcher, join)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Known instance URLs, rotated by one on every call.
    pub fn servers(&self) -> Result<Vec<String>, DiscoveryError> {
        let list = self.snapshot.borrow().clone();
        if list.is_empty() {
            return Err(DiscoveryError::NoServers(self.service.clone()));
        }
        Ok(rotated(&list, &self.cursor))
    }

    /// Latest full list; a new value is published only when membership changes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.snapshot.clone()
    }
}

struct WatchLoop {
    client: Arc<dyn CoordinationClient>,
    service: String,
    path: String,
    backoff: WatchBackoff,
    /// Instance ids of the last published snapshot.
    known: HashSet<Uuid>,
    tx: watch::Sender<Vec<String>>,
}

impl WatchLoop {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(service = %self.service, path = %self.path, "registry watcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.client.watch_children(&self.path).await {
                Ok(ChildrenWatch { children, event }) => {
                    self.refresh(children).await;
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                        fired = event => match fired {
                            Ok(WatchEvent::ChildrenChanged) | Ok(WatchEvent::NodeDeleted) => None,
                            Ok(WatchEvent::SessionExpired) => {
                                warn!(service = %self.service, "watch session expired, re-watching");
                                None
                            }
                            Err(_) => {
                                warn!(service = %self.service, "watch dropped by coordination client");
                                Some(self.backoff.error)
                            }
                        },
                    }
                }
                Err(err) if err.is_no_node() => {
                    // パスが無い = インスタンス 0 件
                    self.publish(Vec::new());
                    debug!(service = %self.service, path = %self.path, "service path does not exist yet");
                    Some(self.backoff.no_node)
                }
                Err(err) => {
                    warn!(service = %self.service, error = %err, "watching service instances failed");
                    Some(self.backoff.error)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        info!(service = %self.service, "registry watcher stopped");
    }

    async fn refresh(&mut self, children: Vec<String>) {
        let mut instances = Vec::with_capacity(children.len());
        for child in children {
            let child_path = format!("{}/{}", self.path, child);
            let raw = match self.client.get(&child_path).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(service = %self.service, node = %child_path, error = %err, "skipping unreadable instance node");
                    continue;
                }
            };
            match serde_json::from_slice::<ServerInstance>(&raw) {
                Ok(instance) => instances.push(instance),
                Err(err) => {
                    warn!(service = %self.service, node = %child_path, error = %err, "skipping undecodable instance node");
                }
            }
        }
        self.publish(instances);
    }

    fn publish(&mut self, instances: Vec<ServerInstance>) {
        let ids: HashSet<Uuid> = instances.iter().map(|i| i.uuid).collect();
        if ids == self.known {
            return;
        }
        let urls: Vec<String> = instances.iter().map(ServerInstance::url).collect();
        info!(service = %self.service, instances = urls.len(), "service instances changed");
        self.known = ids;
        self.tx.send_replace(urls);
    }
}
