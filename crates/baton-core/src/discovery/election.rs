//! LeaderElector - 協調サービス上のリーダー選出
//!
//! Campaigns for the election path in a loop. The published `LeaderState`
//! is an advisory cache: it can be stale right after leadership moves, so
//! callers that mutate shared state still take the per-task lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ports::coordination::CoordinationClient;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaderState {
    pub is_leader: bool,
    /// Term of the most recent grant seen by this process; 0 before the first.
    pub term: u64,
}

pub struct LeaderElector {
    state: watch::Receiver<LeaderState>,
}

impl LeaderElector {
    pub fn spawn(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        identity: impl Into<String>,
        retry: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(LeaderState::default());
        let campaign = CampaignLoop {
            client,
            path: path.into(),
            identity: identity.into(),
            retry,
            tx,
        };
        let join = tokio::spawn(campaign.run(shutdown));
        (Self { state: rx }, join)
    }

    /// Never blocks.
    pub fn is_master(&self) -> bool {
        self.state.borrow().is_leader
    }

    pub fn term(&self) -> u64 {
        self.state.borrow().term
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }
}

struct CampaignLoop {
    client: Arc<dyn CoordinationClient>,
    path: String,
    identity: String,
    retry: Duration,
    tx: watch::Sender<LeaderState>,
}

impl CampaignLoop {
    fn step_down(&self) {
        self.tx.send_if_modified(|state| {
            let was_leader = state.is_leader;
            state.is_leader = false;
            was_leader
        });
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let granted = tokio::select! {
                _ = shutdown.changed() => break,
                granted = self.client.campaign(&self.path, self.identity.clone().into_bytes()) => granted,
            };

            match granted {
                Ok(mut leadership) => {
                    let term = leadership.term();
                    self.tx.send_replace(LeaderState {
                        is_leader: true,
                        term,
                    });
                    info!(path = %self.path, term, identity = %self.identity, "became leader");

                    tokio::select! {
                        _ = leadership.lost() => {
                            self.step_down();
                            warn!(path = %self.path, term, "leadership lost, campaigning again");
                        }
                        _ = shutdown.changed() => {
                            self.step_down();
                            // leadership を drop して辞退する
                            break;
                        }
                    }
                }
                Err(err) => {
                    self.step_down();
                    warn!(path = %self.path, error = %err, retry_ms = self.retry.as_millis() as u64, "campaign failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.retry) => {}
                    }
                }
            }
        }
        self.step_down();
        info!(path = %self.path, "leader elector stopped");
    }
}
