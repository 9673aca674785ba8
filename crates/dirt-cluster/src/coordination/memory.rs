//! In-process coordination service
//!
//! [`InMemoryCoordinator`] plays the server: one hierarchical namespace shared
//! by every session. [`InMemoryClient`] is one session against it, with fault
//! injection hooks (`suspend`, `resume`, `expire`) that produce the same
//! connection-state sequence a networked client reports.

use super::{
    ConnectionState, CoordinationClient, CreateMode, SessionId, Stat, Watch, WatchEventKind,
    WatchedEvent,
};
use crate::error::{ClusterError, Result};
use crate::paths;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

const CONNECTION_EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Node {
    data: Bytes,
    czxid: u64,
    mzxid: u64,
    version: u32,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Bytes, zxid: u64, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            czxid: zxid,
            mzxid: zxid,
            version: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            czxid: self.czxid,
            mzxid: self.mzxid,
            version: self.version,
            ephemeral_owner: self.ephemeral_owner,
            num_children: self.children.len(),
        }
    }
}

struct Watcher {
    client_id: u64,
    path: String,
    connected: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl Watcher {
    fn matches(&self, event: &WatchedEvent) -> bool {
        if event.path == self.path {
            return true;
        }
        event.kind != WatchEventKind::NodeChildrenChanged
            && paths::parent(&event.path) == Some(self.path.as_str())
    }
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    zxid: u64,
    next_session: SessionId,
    next_client: u64,
    sessions: HashSet<SessionId>,
    watchers: Vec<Watcher>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new(), 0, None));
        Self {
            nodes,
            zxid: 0,
            next_session: 1,
            next_client: 1,
            sessions: HashSet::new(),
            watchers: Vec::new(),
        }
    }

    fn open_session(&mut self) -> SessionId {
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(id);
        id
    }

    fn close_session(&mut self, session: SessionId) -> usize {
        if !self.sessions.remove(&session) {
            return 0;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            self.remove(path);
        }
        owned.len()
    }

    fn notify(&mut self, kind: WatchEventKind, path: &str) {
        let event = WatchedEvent {
            kind,
            path: path.to_string(),
        };
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if watcher.connected.load(Ordering::Acquire) && watcher.matches(&event) {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }

    fn create(
        &mut self,
        session: SessionId,
        path: &str,
        data: Bytes,
        mode: CreateMode,
    ) -> Result<String> {
        paths::validate(path)?;
        if path == "/" {
            return Err(ClusterError::NodeExists(path.to_string()));
        }
        let parent_path = paths::parent(path)
            .ok_or_else(|| ClusterError::InvalidPath(path.to_string()))?
            .to_string();

        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| ClusterError::NoNode(parent_path.clone()))?;
        if parent.ephemeral_owner.is_some() {
            return Err(ClusterError::InvalidState(format!(
                "ephemeral node {parent_path} cannot have children"
            )));
        }

        let actual = if mode.is_sequential() {
            let sequence = parent.next_sequence;
            parent.next_sequence += 1;
            format!("{path}{sequence:010}")
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(ClusterError::NodeExists(actual));
        }

        self.zxid += 1;
        let owner = mode.is_ephemeral().then_some(session);
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            parent
                .children
                .insert(paths::strip_path(&actual).to_string());
        }
        self.nodes
            .insert(actual.clone(), Node::new(data, self.zxid, owner));

        self.notify(WatchEventKind::NodeCreated, &actual);
        self.notify(WatchEventKind::NodeChildrenChanged, &parent_path);
        Ok(actual)
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        paths::validate(path)?;
        if path == "/" {
            return Err(ClusterError::InvalidPath(path.to_string()));
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| ClusterError::NoNode(path.to_string()))?;
        if !node.children.is_empty() {
            return Err(ClusterError::NotEmpty(path.to_string()));
        }
        self.remove(path);
        Ok(())
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.zxid += 1;
        let parent_path = paths::parent(path).map(str::to_string);
        if let Some(parent_path) = &parent_path {
            if let Some(parent) = self.nodes.get_mut(parent_path) {
                parent.children.remove(paths::strip_path(path));
            }
        }
        self.notify(WatchEventKind::NodeDeleted, path);
        if let Some(parent_path) = parent_path {
            self.notify(WatchEventKind::NodeChildrenChanged, &parent_path);
        }
    }

    fn set_data(&mut self, path: &str, data: Bytes) -> Result<Stat> {
        self.zxid += 1;
        let zxid = self.zxid;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| ClusterError::NoNode(path.to_string()))?;
        node.data = data;
        node.mzxid = zxid;
        node.version += 1;
        let stat = node.stat();
        self.notify(WatchEventKind::NodeDataChanged, path);
        Ok(stat)
    }

    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| ClusterError::NoNode(path.to_string()))
    }
}

/// In-process coordination service shared by any number of sessions
#[derive(Clone)]
pub struct InMemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree.lock();
        f.debug_struct("InMemoryCoordinator")
            .field("nodes", &tree.nodes.len())
            .field("sessions", &tree.sessions.len())
            .finish()
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Open a new connected session
    pub fn connect(&self) -> Arc<InMemoryClient> {
        let (client_id, session) = {
            let mut tree = self.tree.lock();
            let client_id = tree.next_client;
            tree.next_client += 1;
            (client_id, tree.open_session())
        };
        let (events, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        debug!(session, "Opened coordination session");
        Arc::new(InMemoryClient {
            client_id,
            tree: self.tree.clone(),
            session: AtomicU64::new(session),
            connected: Arc::new(AtomicBool::new(true)),
            expired: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
        })
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.tree.lock().sessions.len()
    }

    /// Whether a node exists, ignoring connection state
    pub fn contains(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }
}

/// One session against an [`InMemoryCoordinator`]
pub struct InMemoryClient {
    client_id: u64,
    tree: Arc<Mutex<Tree>>,
    session: AtomicU64,
    connected: Arc<AtomicBool>,
    expired: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionState>,
}

impl std::fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryClient")
            .field("session", &self.session_id())
            .field("connected", &self.is_connected())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl InMemoryClient {
    /// Drop the connection but keep the session (and its ephemeral nodes)
    pub fn suspend(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(session = self.session_id(), "Coordination connection suspended");
            let _ = self.events.send(ConnectionState::Suspended);
        }
    }

    /// Re-establish the connection. An expired session is replaced by a new
    /// one; its ephemeral nodes are already gone.
    pub fn resume(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.expired.swap(false, Ordering::AcqRel) {
            let session = self.tree.lock().open_session();
            self.session.store(session, Ordering::Release);
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!(session = self.session_id(), "Coordination connection re-established");
            let _ = self.events.send(ConnectionState::Reconnected);
        }
    }

    /// Kill the session: its ephemeral nodes are removed and the client
    /// reports the connection lost until [`resume`](Self::resume)
    pub fn expire(&self) {
        if self.closed.load(Ordering::Acquire) || self.expired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let session = self.session_id();
        let removed = self.tree.lock().close_session(session);
        info!(session, removed, "Coordination session expired");
        let _ = self.events.send(ConnectionState::Lost);
    }

    /// End the session for good
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        let session = self.session_id();
        {
            let mut tree = self.tree.lock();
            tree.close_session(session);
            tree.watchers.retain(|w| w.client_id != self.client_id);
        }
        debug!(session, "Coordination session closed");
        let _ = self.events.send(ConnectionState::Lost);
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ClusterError::Closed)
        } else if self.expired.load(Ordering::Acquire) {
            Err(ClusterError::SessionExpired)
        } else if !self.connected.load(Ordering::Acquire) {
            Err(ClusterError::ConnectionLoss)
        } else {
            Ok(())
        }
    }
}

impl Drop for InMemoryClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl CoordinationClient for InMemoryClient {
    fn session_id(&self) -> SessionId {
        self.session.load(Ordering::Acquire)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String> {
        self.check()?;
        self.tree
            .lock()
            .create(self.session_id(), path, data, mode)
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.check()?;
        Ok(self.tree.lock().nodes.get(path).map(Node::stat))
    }

    async fn get_data(&self, path: &str) -> Result<(Bytes, Stat)> {
        self.check()?;
        let tree = self.tree.lock();
        let node = tree.node(path)?;
        Ok((node.data.clone(), node.stat()))
    }

    async fn set_data(&self, path: &str, data: Bytes) -> Result<Stat> {
        self.check()?;
        self.tree.lock().set_data(path, data)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check()?;
        let tree = self.tree.lock();
        Ok(tree.node(path)?.children.iter().cloned().collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check()?;
        self.tree.lock().delete(path)
    }

    fn watch(&self, path: &str) -> Result<Watch> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Closed);
        }
        paths::validate(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.tree.lock().watchers.push(Watcher {
            client_id: self.client_id,
            path: path.to_string(),
            connected: self.connected.clone(),
            tx,
        });
        Ok(Watch::new(path, rx))
    }
}
