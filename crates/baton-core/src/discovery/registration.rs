//! Registration - 自ノードの ephemeral 登録を維持する
//!
//! An ephemeral instance node dies with the session that created it. The
//! keeper watches its own node and creates it again whenever it is deleted
//! or the session expires, until discovery shuts down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::errors::CoordinationError;
use crate::ports::coordination::{CoordinationClient, ValueWatch, WatchEvent};

pub(crate) struct RegistrationKeeper {
    client: Arc<dyn CoordinationClient>,
    path: String,
    data: Vec<u8>,
    error_backoff: Duration,
}

impl RegistrationKeeper {
    /// Keep `path` alive with `data`. The node must already exist.
    pub(crate) fn spawn(
        client: Arc<dyn CoordinationClient>,
        path: String,
        data: Vec<u8>,
        error_backoff: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let keeper = Self {
            client,
            path,
            data,
            error_backoff,
        };
        tokio::spawn(keeper.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(node = %self.path, "registration keeper started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.client.watch_value(&self.path).await {
                Ok(ValueWatch { event, .. }) => {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                        fired = event => match fired {
                            Ok(WatchEvent::NodeDeleted) | Ok(WatchEvent::SessionExpired) => {
                                self.recreate().await
                            }
                            // 値の watch では起きないが、張り直すだけ
                            Ok(WatchEvent::ChildrenChanged) => None,
                            Err(_) => {
                                warn!(node = %self.path, "watch dropped by coordination client");
                                Some(self.error_backoff)
                            }
                        },
                    }
                }
                Err(err) if err.is_no_node() => self.recreate().await,
                Err(err) => {
                    warn!(node = %self.path, error = %err, "watching own registration failed");
                    Some(self.error_backoff)
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

        if let Err(err) = self.client.delete(&self.path).await
            && !err.is_no_node()
        {
            warn!(node = %self.path, error = %err, "deregistering server instance failed");
        }
        info!(node = %self.path, "server instance deregistered");
    }

    /// `None` means watch again right away.
    async fn recreate(&self) -> Option<Duration> {
        match self
            .client
            .create_ephemeral(&self.path, self.data.clone())
            .await
        {
            Ok(()) => {
                info!(node = %self.path, "re-registered server instance");
                None
            }
            Err(CoordinationError::NodeExists(_)) => None,
            Err(err) => {
                warn!(node = %self.path, error = %err, "re-registering server instance failed");
                Some(self.error_backoff)
            }
        }
    }
}
