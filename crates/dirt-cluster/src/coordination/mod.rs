//! Coordination service abstraction
//!
//! The supervisor needs a hierarchical namespace with ephemeral
//! (session-bound) and sequential nodes, persistent change watches, and a
//! stream of connection-state transitions. ZooKeeper is the reference
//! service; anything offering the same primitives can implement
//! [`CoordinationClient`].
//!
//! - **memory**: in-process service used by single-node mode and tests

pub mod memory;

pub use memory::{InMemoryClient, InMemoryCoordinator};

use crate::error::{ClusterError, Result};
use crate::paths;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

/// Coordination session identifier
pub type SessionId = u64;

/// Node creation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    /// Removed by the service when the creating session ends
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Global creation order
    pub czxid: u64,
    /// Global order of the last modification
    pub mzxid: u64,
    /// Number of data changes
    pub version: u32,
    /// Owning session of an ephemeral node
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
}

/// Client connection state as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First successful connection
    Connected,
    /// Connection dropped; the session may still be alive
    Suspended,
    /// Connection re-established
    Reconnected,
    /// Session expired or client closed
    Lost,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

/// Kind of a watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// Watch notification. `path` is the node that changed: the watched path
/// itself, or one of its direct children for data changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// Persistent watch on a path; notifications stop when dropped
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: mpsc::UnboundedReceiver<WatchedEvent>,
}

impl Watch {
    pub fn new(path: impl Into<String>, rx: mpsc::UnboundedReceiver<WatchedEvent>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next notification, `None` once the client is gone
    pub async fn recv(&mut self) -> Option<WatchedEvent> {
        self.rx.recv().await
    }
}

/// Handle to a coordination service session
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Current session id
    fn session_id(&self) -> SessionId;

    fn is_connected(&self) -> bool;

    /// Subscribe to connection-state transitions
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;

    /// Create a node; returns the actual path (with sequence suffix if any)
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String>;

    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    async fn get_data(&self, path: &str) -> Result<(Bytes, Stat)>;

    async fn set_data(&self, path: &str, data: Bytes) -> Result<Stat>;

    /// Child names (not full paths) of a node
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a node without children
    async fn delete(&self, path: &str) -> Result<()>;

    /// Start a persistent watch on a path and its direct children
    fn watch(&self, path: &str) -> Result<Watch>;

    /// Create every missing node along `path`
    async fn ensure_path(&self, path: &str) -> Result<()> {
        paths::validate(path)?;
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, Bytes::new(), CreateMode::Persistent).await {
                Ok(_) | Err(ClusterError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete a node and everything beneath it. Nodes removed concurrently
    /// by another client are not an error.
    async fn delete_recursive(&self, path: &str) -> Result<()> {
        let mut pending = vec![path.to_string()];
        let mut ordered = Vec::new();
        while let Some(node) = pending.pop() {
            match self.get_children(&node).await {
                Ok(children) => {
                    pending.extend(children.iter().map(|c| paths::join(&node, c)));
                    ordered.push(node);
                }
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }

        // deepest first
        for node in ordered.iter().rev() {
            match self.delete(node).await {
                Ok(()) => {}
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Reconnected.is_connected());
        assert!(!ConnectionState::Suspended.is_connected());
        assert!(!ConnectionState::Lost.is_connected());
    }
}
