//! In-memory coordination service.
//!
//! One `InMemoryCoordinator` plays the server; every `connect()` opens a
//! session. Ephemeral nodes, watches and leadership belong to the session
//! that created them. `expire()` ends a session the way a ZooKeeper server
//! would after a partition longer than the session timeout; the handle then
//! continues on a fresh session, like a client library that reconnects.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::debug;

use crate::domain::errors::CoordinationError;
use crate::ports::coordination::{
    ChildrenWatch, CoordinationClient, Leadership, ValueWatch, WatchEvent,
};

type SessionId = u64;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    /// `None` for persistent nodes.
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct PendingWatch {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Debug)]
struct Holder {
    session: SessionId,
    term: u64,
    revoke: watch::Sender<bool>,
}

#[derive(Debug)]
struct Election {
    holder: Option<Holder>,
    /// Bumped whenever waiting campaigners should look again.
    changed: watch::Sender<u64>,
}

impl Election {
    fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            holder: None,
            changed,
        }
    }

    fn wake_waiters(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}

#[derive(Debug, Default)]
struct CoordState {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<PendingWatch>>,
    value_watches: HashMap<String, Vec<PendingWatch>>,
    elections: HashMap<String, Election>,
    next_session: SessionId,
    next_term: u64,
    unavailable: bool,
}

fn parent_of(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        if path.len() > 1 { Some("/") } else { None }
    } else {
        Some(&path[..idx])
    }
}

fn child_name_of<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    let rest = if parent == "/" {
        path.strip_prefix('/')?
    } else {
        path.strip_prefix(parent)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

impl CoordState {
    fn check_available(&self) -> Result<(), CoordinationError> {
        if self.unavailable {
            return Err(CoordinationError::ConnectionLoss(
                "coordination service unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn allocate_session(&mut self) -> SessionId {
        self.next_session += 1;
        self.next_session
    }

    fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        if !self.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        Ok(self
            .nodes
            .keys()
            .filter_map(|key| child_name_of(path, key))
            .map(str::to_string)
            .collect())
    }

    fn fire(watches: &mut HashMap<String, Vec<PendingWatch>>, path: &str, event: WatchEvent) {
        if let Some(pending) = watches.remove(path) {
            for watch in pending {
                let _ = watch.tx.send(event);
            }
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(parent) = current {
            if self.nodes.contains_key(parent) {
                break;
            }
            missing.push(parent.to_string());
            current = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            self.insert_node(parent, Vec::new(), None);
        }
    }

    fn insert_node(&mut self, path: String, data: Vec<u8>, owner: Option<SessionId>) {
        if let Some(parent) = parent_of(&path) {
            Self::fire(&mut self.child_watches, parent, WatchEvent::ChildrenChanged);
        }
        self.nodes.insert(path, Node { data, owner });
    }

    fn remove_node(&mut self, path: &str) -> Option<Node> {
        let node = self.nodes.remove(path)?;
        Self::fire(&mut self.value_watches, path, WatchEvent::NodeDeleted);
        Self::fire(&mut self.child_watches, path, WatchEvent::NodeDeleted);
        if let Some(parent) = parent_of(path) {
            Self::fire(&mut self.child_watches, parent, WatchEvent::ChildrenChanged);
        }
        Some(node)
    }

    fn release_election(&mut self, path: &str, term: u64) {
        let released = match self.elections.get_mut(path) {
            Some(election) if election.holder.as_ref().is_some_and(|h| h.term == term) => {
                election.holder = None;
                election.wake_waiters();
                true
            }
            _ => false,
        };
        if released {
            self.remove_node(path);
        }
    }

    fn end_session(&mut self, session: SessionId) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut lost_elections = Vec::new();
        for (path, election) in &mut self.elections {
            if let Some(holder) = &election.holder
                && holder.session == session
            {
                let _ = holder.revoke.send(true);
                election.holder = None;
                lost_elections.push(path.clone());
            }
            election.wake_waiters();
        }

        for watches in [&mut self.child_watches, &mut self.value_watches] {
            for pending in watches.values_mut() {
                let (expired, kept): (Vec<_>, Vec<_>) =
                    pending.drain(..).partition(|w| w.session == session);
                *pending = kept;
                for watch in expired {
                    let _ = watch.tx.send(WatchEvent::SessionExpired);
                }
            }
            watches.retain(|_, pending| !pending.is_empty());
        }

        for path in owned {
            self.remove_node(&path);
        }
        for path in lost_elections {
            self.remove_node(&path);
        }
    }
}

/// The coordination "server". Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordinator {
    state: Arc<Mutex<CoordState>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client session.
    pub async fn connect(&self) -> InMemorySession {
        let session = self.state.lock().await.allocate_session();
        InMemorySession {
            state: Arc::clone(&self.state),
            session: Arc::new(AtomicU64::new(session)),
        }
    }

    /// While unavailable every call fails with `ConnectionLoss`. Sessions survive.
    pub async fn set_unavailable(&self, unavailable: bool) {
        let mut state = self.state.lock().await;
        state.unavailable = unavailable;
        for election in state.elections.values() {
            election.wake_waiters();
        }
    }

    /// Persistent node, e.g. a service path that exists before any instance registers.
    pub async fn create_persistent(&self, path: &str, data: Vec<u8>) {
        let mut state = self.state.lock().await;
        state.ensure_parents(path);
        state.insert_node(path.to_string(), data, None);
    }

    pub async fn exists(&self, path: &str) -> bool {
        self.state.lock().await.nodes.contains_key(path)
    }
}

/// One client session of an `InMemoryCoordinator`.
#[derive(Debug, Clone)]
pub struct InMemorySession {
    state: Arc<Mutex<CoordState>>,
    session: Arc<AtomicU64>,
}

impl InMemorySession {
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// End the current session and continue on a fresh one.
    ///
    /// Ephemeral nodes of the old session disappear, its leadership is
    /// revoked and its pending watches fire `SessionExpired`.
    pub async fn expire(&self) {
        let mut state = self.state.lock().await;
        let old = self.session.load(Ordering::SeqCst);
        state.end_session(old);
        let new = state.allocate_session();
        self.session.store(new, Ordering::SeqCst);
        debug!(old_session = old, new_session = new, "coordination session expired");
    }
}

#[async_trait]
impl CoordinationClient for InMemorySession {
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        state.ensure_parents(path);
        let owner = self.session_id();
        state.insert_node(path.to_string(), data, Some(owner));
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let state = self.state.lock().await;
        state.check_available()?;
        state.children(path)
    }

    async fn watch_children(&self, path: &str) -> Result<ChildrenWatch, CoordinationError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let children = state.children(path)?;
        let (tx, event) = oneshot::channel();
        state
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(PendingWatch {
                session: self.session_id(),
                tx,
            });
        Ok(ChildrenWatch { children, event })
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordinationError> {
        let state = self.state.lock().await;
        state.check_available()?;
        state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn watch_value(&self, path: &str) -> Result<ValueWatch, CoordinationError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let value = state
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        let (tx, event) = oneshot::channel();
        state
            .value_watches
            .entry(path.to_string())
            .or_default()
            .push(PendingWatch {
                session: self.session_id(),
                tx,
            });
        Ok(ValueWatch { value, event })
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state
            .remove_node(path)
            .map(|_| ())
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn campaign(&self, path: &str, value: Vec<u8>) -> Result<Leadership, CoordinationError> {
        let session = self.session_id();
        loop {
            let mut changed = {
                let mut guard = self.state.lock().await;
                let state = &mut *guard;
                state.check_available()?;
                if self.session_id() != session {
                    return Err(CoordinationError::SessionExpired);
                }

                let election = state
                    .elections
                    .entry(path.to_string())
                    .or_insert_with(Election::new);
                if election.holder.is_some() {
                    election.changed.subscribe()
                } else {
                    state.next_term += 1;
                    let term = state.next_term;
                    let (revoke, revoked) = watch::channel(false);
                    if let Some(election) = state.elections.get_mut(path) {
                        election.holder = Some(Holder {
                            session,
                            term,
                            revoke,
                        });
                    }
                    state.ensure_parents(path);
                    state.insert_node(path.to_string(), value, Some(session));

                    let (release, released) = oneshot::channel::<()>();
                    let shared = Arc::clone(&self.state);
                    let election_path = path.to_string();
                    tokio::spawn(async move {
                        // Leadership が drop されたら解放
                        let _ = released.await;
                        shared.lock().await.release_election(&election_path, term);
                    });

                    debug!(path, term, session, "campaign granted");
                    return Ok(Leadership::new(term, revoked, Some(release)));
                }
            };

            if changed.changed().await.is_err() {
                return Err(CoordinationError::Backend(
                    "election state dropped".to_string(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ephemeral_nodes_are_listed_under_their_parent() {
        let coordinator = InMemoryCoordinator::new();
        let session = coordinator.connect().await;

        session
            .create_ephemeral("/baton/services/host/a", b"1".to_vec())
            .await
            .unwrap();
        session
            .create_ephemeral("/baton/services/host/b", b"2".to_vec())
            .await
            .unwrap();

        let mut children = session.get_children("/baton/services/host").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(session.get("/baton/services/host/b").await.unwrap(), b"2");
        assert_eq!(
            session.get_children("/baton/services").await.unwrap(),
            vec!["host".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_path_is_no_node() {
        let coordinator = InMemoryCoordinator::new();
        let session = coordinator.connect().await;
        let err = session.watch_children("/nope").await.unwrap_err();
        assert!(err.is_no_node());
    }

    #[tokio::test]
    async fn creating_twice_is_node_exists() {
        let coordinator = InMemoryCoordinator::new();
        let session = coordinator.connect().await;
        session.create_ephemeral("/x", Vec::new()).await.unwrap();
        assert_eq!(
            session.create_ephemeral("/x", Vec::new()).await,
            Err(CoordinationError::NodeExists("/x".to_string()))
        );
    }

    #[tokio::test]
    async fn children_watch_fires_once_on_change() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.create_persistent("/svc", Vec::new()).await;
        let watcher = coordinator.connect().await;
        let other = coordinator.connect().await;

        let watch = watcher.watch_children("/svc").await.unwrap();
        assert!(watch.children.is_empty());

        other.create_ephemeral("/svc/a", Vec::new()).await.unwrap();
        assert_eq!(watch.event.await.unwrap(), WatchEvent::ChildrenChanged);
    }

    #[tokio::test]
    async fn expiry_removes_ephemerals_and_notifies_watchers() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.create_persistent("/svc", Vec::new()).await;
        let owner = coordinator.connect().await;
        let observer = coordinator.connect().await;

        owner.create_ephemeral("/svc/a", Vec::new()).await.unwrap();
        let watch = observer.watch_children("/svc").await.unwrap();
        assert_eq!(watch.children, vec!["a".to_string()]);

        let old_session = owner.session_id();
        owner.expire().await;

        assert_eq!(watch.event.await.unwrap(), WatchEvent::ChildrenChanged);
        assert!(observer.get_children("/svc").await.unwrap().is_empty());
        assert_ne!(owner.session_id(), old_session);
    }

    #[tokio::test]
    async fn watches_of_an_expired_session_report_expiry() {
        let coordinator = InMemoryCoordinator::new();
        coordinator.create_persistent("/svc", Vec::new()).await;
        let session = coordinator.connect().await;

        let watch = session.watch_children("/svc").await.unwrap();
        session.expire().await;

        assert_eq!(watch.event.await.unwrap(), WatchEvent::SessionExpired);
    }

    #[tokio::test]
    async fn unavailable_backend_is_connection_loss() {
        let coordinator = InMemoryCoordinator::new();
        let session = coordinator.connect().await;
        coordinator.set_unavailable(true).await;
        assert!(matches!(
            session.get_children("/").await,
            Err(CoordinationError::ConnectionLoss(_))
        ));
        coordinator.set_unavailable(false).await;
        assert!(session.create_ephemeral("/a", Vec::new()).await.is_ok());
    }

    #[tokio::test]
    async fn campaign_grants_one_holder_at_a_time() {
        let coordinator = InMemoryCoordinator::new();
        let first = coordinator.connect().await;
        let second = coordinator.connect().await;

        let leadership = first
            .campaign("/baton/election/master", b"first".to_vec())
            .await
            .unwrap();
        assert_eq!(first.get("/baton/election/master").await.unwrap(), b"first");

        let waiting = tokio::spawn(async move {
            second
                .campaign("/baton/election/master", b"second".to_vec())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let first_term = leadership.term();
        drop(leadership);

        let granted = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(granted.term() > first_term);
        assert_eq!(first.get("/baton/election/master").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn expiry_revokes_leadership() {
        let coordinator = InMemoryCoordinator::new();
        let session = coordinator.connect().await;
        let mut leadership = session.campaign("/e", Vec::new()).await.unwrap();

        session.expire().await;

        tokio::time::timeout(Duration::from_secs(1), leadership.lost())
            .await
            .unwrap();
        assert!(!coordinator.exists("/e").await);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/"), None);
        assert_eq!(child_name_of("/a", "/a/b"), Some("b"));
        assert_eq!(child_name_of("/a", "/a/b/c"), None);
        assert_eq!(child_name_of("/", "/a"), Some("a"));
        assert_eq!(child_name_of("/a", "/ab"), None);
    }
}
