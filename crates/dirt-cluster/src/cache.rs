//! Path children cache
//!
//! Keeps a local copy of every direct child of one coordination path and
//! tells listeners what changed. The cached set is published as immutable
//! generations: readers clone an `Arc` to the current map and can iterate
//! it for as long as they like while the cache's task installs newer ones.
//! Only that task writes.

use crate::coordination::{ConnectionState, CoordinationClient, Stat, Watch, WatchEventKind};
use crate::error::{ClusterError, Result};
use crate::observability::CacheMetrics;
use crate::paths;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// One cached child node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildData {
    /// Full path of the child
    pub path: String,
    pub stat: Stat,
    pub data: Bytes,
}

impl ChildData {
    /// Child name (last path segment)
    pub fn name(&self) -> &str {
        paths::strip_path(&self.path)
    }
}

/// A cached child set generation, keyed by full path
pub type ChildMap = BTreeMap<String, ChildData>;

/// Change notification delivered to [`ChildEventListener`]s
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    ChildAdded(ChildData),
    ChildUpdated(ChildData),
    ChildRemoved(ChildData),
    /// Initial child set fully delivered (`StartMode::PostInitializedEvent`)
    Initialized,
    ConnectionSuspended,
    ConnectionReconnected,
    ConnectionLost,
}

impl ChildEvent {
    pub fn data(&self) -> Option<&ChildData> {
        match self {
            ChildEvent::ChildAdded(data)
            | ChildEvent::ChildUpdated(data)
            | ChildEvent::ChildRemoved(data) => Some(data),
            _ => None,
        }
    }

    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            ChildEvent::ChildAdded(_) => "child_added",
            ChildEvent::ChildUpdated(_) => "child_updated",
            ChildEvent::ChildRemoved(_) => "child_removed",
            ChildEvent::Initialized => "initialized",
            ChildEvent::ConnectionSuspended => "connection_suspended",
            ChildEvent::ConnectionReconnected => "connection_reconnected",
            ChildEvent::ConnectionLost => "connection_lost",
        }
    }
}

/// How [`PathChildrenCache::start`] loads the initial child set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Load before `start` returns; no events for the initial set
    BuildInitialCache,
    /// Load in the background, emit `ChildAdded` per child, then `Initialized`
    PostInitializedEvent,
    /// Load in the background, emit `ChildAdded` per child
    Normal,
}

/// Receives cache change notifications, in delivery order, on the cache's
/// task
#[async_trait]
pub trait ChildEventListener: Send + Sync + 'static {
    async fn child_event(&self, client: &dyn CoordinationClient, event: &ChildEvent)
        -> Result<()>;
}

/// Watched cache of a path's direct children
pub struct PathChildrenCache {
    name: String,
    path: String,
    client: Arc<dyn CoordinationClient>,
    data: RwLock<Arc<ChildMap>>,
    listeners: RwLock<Vec<Arc<dyn ChildEventListener>>>,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PathChildrenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathChildrenCache")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("children", &self.data.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PathChildrenCache {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            path: path.into(),
            client,
            data: RwLock::new(Arc::new(ChildMap::new())),
            listeners: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Arc<dyn ChildEventListener>) {
        if !self.is_closed() {
            self.listeners.write().push(listener);
        }
    }

    /// Current generation; empty before the first load and after close
    pub fn current_data(&self) -> Arc<ChildMap> {
        self.data.read().clone()
    }

    pub fn get(&self, path: &str) -> Option<ChildData> {
        self.data.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start watching. Fails if already started or closed.
    pub async fn start(self: &Arc<Self>, mode: StartMode) -> Result<()> {
        if self.is_closed() {
            return Err(ClusterError::InvalidState(format!(
                "cache {} is closed",
                self.name
            )));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ClusterError::InvalidState(format!(
                "cache {} already started",
                self.name
            )));
        }

        // watch first: a change between listing and subscribing is never lost
        let watch = self.client.watch(&self.path)?;
        let connection = self.client.connection_events();

        if mode == StartMode::BuildInitialCache {
            self.refresh(false).await?;
        }

        let task = tokio::spawn(Self::run(
            Arc::downgrade(self),
            watch,
            connection,
            mode,
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(task);
        debug!(cache = %self.name, path = %self.path, ?mode, "Path children cache started");
        Ok(())
    }

    /// Stop watching, drop listeners and publish an empty generation.
    /// Idempotent. No event is dispatched once close has begun, but a
    /// listener call already in flight may still complete afterwards.
    pub fn close(&self) {
        {
            let mut data = self.data.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            *data = Arc::new(ChildMap::new());
        }
        self.cancel.cancel();
        self.listeners.write().clear();
        self.task.lock().take();
        CacheMetrics::set_size(&self.name, 0);
        debug!(cache = %self.name, "Path children cache closed");
    }

    async fn run(
        cache: Weak<Self>,
        mut watch: Watch,
        mut connection: broadcast::Receiver<ConnectionState>,
        mode: StartMode,
        cancel: CancellationToken,
    ) {
        let mut initialized = mode != StartMode::PostInitializedEvent;
        if mode != StartMode::BuildInitialCache {
            match cache.upgrade() {
                Some(cache) => cache.load(&mut initialized).await,
                None => return,
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = watch.recv() => {
                    let Some(event) = event else { break };
                    let Some(cache) = cache.upgrade() else { break };
                    trace!(cache = %cache.name, ?event, "Watch notification");
                    if event.path == cache.path {
                        if event.kind != WatchEventKind::NodeDataChanged {
                            cache.load(&mut initialized).await;
                        }
                    } else if event.kind == WatchEventKind::NodeDataChanged {
                        cache.refresh_child(&event.path).await;
                    }
                }
                state = connection.recv() => {
                    let Some(cache) = cache.upgrade() else { break };
                    match state {
                        Ok(ConnectionState::Suspended) => {
                            cache.dispatch(ChildEvent::ConnectionSuspended).await
                        }
                        Ok(ConnectionState::Lost) => {
                            cache.dispatch(ChildEvent::ConnectionLost).await
                        }
                        Ok(ConnectionState::Connected | ConnectionState::Reconnected) => {
                            cache.dispatch(ChildEvent::ConnectionReconnected).await;
                            cache.load(&mut initialized).await;
                        }
                        Err(RecvError::Lagged(_)) => {
                            if cache.client.is_connected() {
                                cache.load(&mut initialized).await;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        trace!("Path children cache task stopped");
    }

    /// Refresh with events, emitting `Initialized` after the first success
    /// when requested
    async fn load(&self, initialized: &mut bool) {
        match self.refresh(true).await {
            Ok(()) => {
                if !*initialized {
                    *initialized = true;
                    self.dispatch(ChildEvent::Initialized).await;
                }
            }
            Err(e) => {
                CacheMetrics::increment_refresh_errors(&self.name);
                warn!(cache = %self.name, error = %e, "Failed to refresh children, retrying on next change");
            }
        }
    }

    /// Re-list the path, install the new generation and (optionally) emit
    /// the differences
    async fn refresh(&self, emit: bool) -> Result<()> {
        let names = match self.client.get_children(&self.path).await {
            Ok(names) => names,
            Err(e) if e.is_no_node() => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut next = ChildMap::new();
        for name in names {
            let path = paths::join(&self.path, &name);
            match self.client.get_data(&path).await {
                Ok((data, stat)) => {
                    next.insert(path.clone(), ChildData { path, stat, data });
                }
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }

        let next = Arc::new(next);
        let previous = {
            let mut data = self.data.write();
            if self.is_closed() {
                return Ok(());
            }
            std::mem::replace(&mut *data, next.clone())
        };
        CacheMetrics::set_size(&self.name, next.len());

        if emit {
            for event in diff(&previous, &next) {
                self.dispatch(event).await;
            }
        }
        Ok(())
    }

    async fn refresh_child(&self, path: &str) {
        let (data, stat) = match self.client.get_data(path).await {
            Ok(found) => found,
            Err(e) if e.is_no_node() => return,
            Err(e) => {
                CacheMetrics::increment_refresh_errors(&self.name);
                warn!(cache = %self.name, path = %path, error = %e, "Failed to refresh child");
                return;
            }
        };

        let updated = {
            let mut current = self.data.write();
            if self.is_closed() {
                return;
            }
            match current.get(path) {
                Some(existing)
                    if existing.stat.czxid == stat.czxid && existing.stat.mzxid < stat.mzxid => {}
                // unknown or re-created children arrive with the next listing
                _ => return,
            }
            let child = ChildData {
                path: path.to_string(),
                stat,
                data,
            };
            let mut next = ChildMap::clone(&current);
            next.insert(path.to_string(), child.clone());
            *current = Arc::new(next);
            child
        };
        self.dispatch(ChildEvent::ChildUpdated(updated)).await;
    }

    async fn dispatch(&self, event: ChildEvent) {
        if self.is_closed() {
            return;
        }
        CacheMetrics::increment_events(&self.name, event.kind());
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if self.is_closed() {
                return;
            }
            if let Err(e) = listener.child_event(self.client.as_ref(), &event).await {
                CacheMetrics::increment_listener_errors(&self.name);
                warn!(cache = %self.name, event = event.kind(), error = %e, "Child event listener failed");
            }
        }
    }
}

impl Drop for PathChildrenCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Events turning `previous` into `next`. A child deleted and created again
/// between two listings is reported as removed, then added.
fn diff(previous: &ChildMap, next: &ChildMap) -> Vec<ChildEvent> {
    let mut events = Vec::new();
    for (path, child) in next {
        match previous.get(path) {
            None => events.push(ChildEvent::ChildAdded(child.clone())),
            Some(old) if old.stat.czxid != child.stat.czxid => {
                events.push(ChildEvent::ChildRemoved(old.clone()));
                events.push(ChildEvent::ChildAdded(child.clone()));
            }
            Some(old) if old.stat.mzxid != child.stat.mzxid || old.data != child.data => {
                events.push(ChildEvent::ChildUpdated(child.clone()))
            }
            Some(_) => {}
        }
    }
    for (path, child) in previous {
        if !next.contains_key(path) {
            events.push(ChildEvent::ChildRemoved(child.clone()));
        }
    }
    events
}
