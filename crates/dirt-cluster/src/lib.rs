//! # Dirt Cluster
//!
//! Leadership and cluster membership for the dirt control plane:
//! - **Leader Election**: at most one admin process issues deployment decisions
//! - **Membership**: watched, lock-free views of live containers and pending deployments
//! - **Reconciliation**: a new leader removes deployments left by departed containers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   DeploymentSupervisor                      │
//! ├──────────────┬──────────────┬───────────────────────────────┤
//! │  Connection  │    Leader    │     Watched Collections       │
//! │   Monitor    │   Elector    │   (path children caches)      │
//! ├──────────────┼──────────────┼───────────────────────────────┤
//! │ • Connect    │ • Latches    │ • Containers                  │
//! │ • Disconnect │ • Revocation │ • Stream / job deployments    │
//! │              │ • Failover   │ • Stream definitions          │
//! └──────────────┴──────────────┴───────────────────────────────┘
//!                               │
//!                    CoordinationClient
//!          (ZooKeeper-style service, in-memory for tests)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use dirt_cluster::prelude::*;
//! use std::sync::Arc;
//!
//! let server = InMemoryCoordinator::new();
//! let client = server.connect();
//! let monitor = ConnectionMonitor::new(client.clone());
//!
//! let supervisor = DeploymentSupervisor::new(
//!     client,
//!     monitor,
//!     Arc::new(LoggingListenerFactory),
//!     SupervisorConfig::builder().admin_id("admin-1").build()?,
//! )?;
//! supervisor.start().await?;
//!
//! for container in &supervisor.membership_snapshot() {
//!     println!("{} is alive", container.id);
//! }
//!
//! supervisor.stop().await?;
//! ```

pub mod cache;
pub mod collection;
pub mod config;
pub mod connection;
pub mod coordination;
pub mod election;
pub mod error;
pub mod listener;
pub mod node;
pub mod observability;
pub mod paths;
pub mod reconcile;
pub mod registration;
pub mod supervisor;

// Re-export main types
pub use cache::{ChildData, ChildEvent, ChildEventListener, PathChildrenCache, StartMode};
pub use collection::{
    ChildConverter, ContainerConverter, RawConverter, Snapshot, SnapshotIter, WatchedCollection,
};
pub use config::{SupervisorConfig, SupervisorConfigBuilder};
pub use connection::{ConnectionListener, ConnectionMonitor, ListenerId};
pub use coordination::{
    ConnectionState, CoordinationClient, CreateMode, InMemoryClient, InMemoryCoordinator,
    SessionId, Stat, Watch, WatchEventKind, WatchedEvent,
};
pub use election::{ElectionState, LeaderElector, LeadershipListener};
pub use error::{ClusterError, Result};
pub use listener::{
    ContainerRepository, DeploymentCollections, DeploymentListenerFactory, LoggingListener,
    LoggingListenerFactory,
};
pub use node::{Container, ContainerId};
pub use observability::{init_metrics, CacheMetrics, ConnectionMetrics, SupervisorMetrics};
pub use paths::Paths;
pub use reconcile::{cleanup_deployments, stale_containers};
pub use registration::ContainerRegistration;
pub use supervisor::DeploymentSupervisor;

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::connection::ConnectionMonitor;
    pub use crate::coordination::{CoordinationClient, InMemoryCoordinator};
    pub use crate::election::ElectionState;
    pub use crate::error::*;
    pub use crate::listener::{ContainerRepository, LoggingListenerFactory};
    pub use crate::node::*;
    pub use crate::supervisor::DeploymentSupervisor;
}
