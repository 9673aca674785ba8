//! Deployment supervisor
//!
//! Ties leadership to cluster membership. Every admin process runs one
//! supervisor; the one that wins the election reconciles deployments left
//! by departed containers, opens watched collections over containers and
//! deployment requests, and publishes the container collection so the rest
//! of the process can read membership without touching the coordination
//! service.
//!
//! ```text
//!  start() ──► request_leadership ──► LeaderElector ──► LeaderTask::take_leadership
//!                    ▲                                     │ cleanup_deployments
//!  on_connect ───────┘                                     │ open caches
//!  on_disconnect ──► close elector ◄── revoked ◄───────────┤ publish membership
//!                                                          │ wait for revocation
//!                                                          └ teardown
//! ```

use crate::cache::{ChildEventListener, PathChildrenCache, StartMode};
use crate::collection::{
    ChildConverter, ContainerConverter, RawConverter, Snapshot, WatchedCollection,
};
use crate::config::SupervisorConfig;
use crate::connection::{ConnectionListener, ConnectionMonitor, ListenerId};
use crate::coordination::CoordinationClient;
use crate::election::{ElectionState, LeaderElector, LeadershipListener};
use crate::error::{ClusterError, Result};
use crate::listener::{ContainerRepository, DeploymentCollections, DeploymentListenerFactory};
use crate::observability::SupervisorMetrics;
use crate::paths::Paths;
use crate::reconcile::cleanup_deployments;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Published container collection, present only while leading
type MembershipSlot = ArcSwapOption<WatchedCollection<ContainerConverter>>;

/// Leadership and membership supervisor (cheap to clone)
#[derive(Clone)]
pub struct DeploymentSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    paths: Paths,
    client: Arc<dyn CoordinationClient>,
    monitor: Arc<ConnectionMonitor>,
    factory: Arc<dyn DeploymentListenerFactory>,
    membership: Arc<MembershipSlot>,
    /// Serializes leadership requests and releases
    bid: tokio::sync::Mutex<()>,
    elector: RwLock<Option<Arc<LeaderElector>>>,
    started: AtomicBool,
    connection_listener: Mutex<Option<ListenerId>>,
}

impl DeploymentSupervisor {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        monitor: Arc<ConnectionMonitor>,
        factory: Arc<dyn DeploymentListenerFactory>,
        config: SupervisorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let paths = Paths::new(config.namespace.clone());
        Ok(Self {
            inner: Arc::new(SupervisorInner {
                config,
                paths,
                client,
                monitor,
                factory,
                membership: Arc::new(ArcSwapOption::empty()),
                bid: tokio::sync::Mutex::new(()),
                elector: RwLock::new(None),
                started: AtomicBool::new(false),
                connection_listener: Mutex::new(None),
            }),
        })
    }

    /// Admin id used in the election
    pub fn id(&self) -> &str {
        &self.inner.config.admin_id
    }

    pub fn paths(&self) -> &Paths {
        &self.inner.paths
    }

    pub fn state(&self) -> ElectionState {
        self.inner
            .elector
            .read()
            .as_ref()
            .map(|e| e.state())
            .unwrap_or(ElectionState::NotContending)
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leading
    }

    /// Live membership while leading, empty otherwise. Never blocks.
    pub fn membership_snapshot(&self) -> Snapshot<ContainerConverter> {
        snapshot_of(&self.inner.membership)
    }

    /// Begin supervising: follow connection transitions and bid for
    /// leadership if connected. Returns the error of that first bid.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let listener = Arc::new(SupervisorConnectionListener {
            inner: Arc::downgrade(&self.inner),
        });
        *self.inner.connection_listener.lock() = Some(self.inner.monitor.add_listener(listener));
        info!(admin_id = %self.id(), namespace = %self.inner.paths.namespace(), "Deployment supervisor started");

        if self.inner.client.is_connected() {
            self.inner.request_leadership().await?;
        }
        Ok(())
    }

    /// Stop supervising and release leadership, waiting for an active term
    /// to finish its teardown. Idempotent; valid before `start`.
    pub async fn stop(&self) -> Result<()> {
        let was_started = self.inner.started.swap(false, Ordering::AcqRel);
        if let Some(id) = self.inner.connection_listener.lock().take() {
            self.inner.monitor.remove_listener(id);
        }
        let _bid = self.inner.bid.lock().await;
        let result = self.inner.release_leadership().await;
        if was_started {
            info!(admin_id = %self.id(), "Deployment supervisor stopped");
        }
        result
    }

    /// Bid for leadership now. Idempotent while an elector runs.
    pub async fn request_leadership(&self) -> Result<()> {
        self.inner.request_leadership().await
    }
}

impl ContainerRepository for DeploymentSupervisor {
    fn containers(&self) -> Snapshot<ContainerConverter> {
        self.membership_snapshot()
    }
}

impl std::fmt::Debug for DeploymentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentSupervisor")
            .field("admin_id", &self.inner.config.admin_id)
            .field("namespace", &self.inner.paths.namespace())
            .field("state", &self.state())
            .finish()
    }
}

fn snapshot_of(slot: &MembershipSlot) -> Snapshot<ContainerConverter> {
    slot.load_full()
        .map(|containers| containers.snapshot())
        .unwrap_or_else(Snapshot::empty)
}

impl SupervisorInner {
    async fn request_leadership(&self) -> Result<()> {
        let _bid = self.bid.lock().await;
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        SupervisorMetrics::increment_leadership_requests();

        let result = self.bid_locked().await;
        if let Err(e) = &result {
            SupervisorMetrics::increment_leadership_request_failures();
            warn!(admin_id = %self.config.admin_id, error = %e, "Leadership request failed");
        }
        result
    }

    async fn bid_locked(&self) -> Result<()> {
        for path in self.paths.required() {
            self.client
                .ensure_path(&path)
                .await
                .map_err(ClusterError::leadership_request)?;
        }

        if self.elector.read().is_some() {
            return Ok(());
        }

        let task = LeaderTask {
            admin_id: self.config.admin_id.clone(),
            paths: self.paths.clone(),
            factory: self.factory.clone(),
            membership: self.membership.clone(),
        };
        let elector = Arc::new(
            LeaderElector::new(
                self.client.clone(),
                self.paths.election(),
                self.config.admin_id.clone(),
                Arc::new(task),
            )
            .with_retry(self.config.election_retry),
        );
        elector.start().map_err(ClusterError::leadership_request)?;
        *self.elector.write() = Some(elector);
        debug!(admin_id = %self.config.admin_id, "Contending for leadership");
        Ok(())
    }

    /// Close the elector, if any, and clear published membership. Callers
    /// hold the bid lock.
    async fn release_leadership(&self) -> Result<()> {
        // readers see no membership while the term tears down; a publish
        // racing this store is undone by the term's own teardown, which
        // `close` waits for
        self.membership.store(None);
        let elector = self.elector.write().take();
        match elector {
            Some(elector) => elector.close().await,
            None => Ok(()),
        }
    }
}

/// Reacts to connection transitions without keeping the supervisor alive
struct SupervisorConnectionListener {
    inner: Weak<SupervisorInner>,
}

#[async_trait]
impl ConnectionListener for SupervisorConnectionListener {
    async fn on_connect(&self, _client: &Arc<dyn CoordinationClient>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !inner.started.load(Ordering::Acquire) {
            return;
        }
        info!(admin_id = %inner.config.admin_id, "Connected, requesting leadership");
        // failure already logged; the next connect retries
        let _ = inner.request_leadership().await;
    }

    async fn on_disconnect(&self, _client: &Arc<dyn CoordinationClient>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        info!(admin_id = %inner.config.admin_id, "Disconnected, releasing leadership");
        inner.membership.store(None);
        let _bid = inner.bid.lock().await;
        if let Err(e) = inner.release_leadership().await {
            warn!(admin_id = %inner.config.admin_id, error = %e, "Failed to release leadership");
        }
    }
}

/// Membership view handed to downstream listeners
struct MembershipView {
    membership: Arc<MembershipSlot>,
}

impl ContainerRepository for MembershipView {
    fn containers(&self) -> Snapshot<ContainerConverter> {
        snapshot_of(&self.membership)
    }
}

/// Collections opened during one leadership term
#[derive(Default)]
struct TermCollections {
    streams: Option<Arc<WatchedCollection<RawConverter>>>,
    stream_deployments: Option<Arc<WatchedCollection<RawConverter>>>,
    job_deployments: Option<Arc<WatchedCollection<RawConverter>>>,
    containers: Option<Arc<WatchedCollection<ContainerConverter>>>,
}

impl TermCollections {
    /// Close in reverse order of construction
    fn close(self) {
        if let Some(containers) = self.containers {
            containers.close();
        }
        let deployments = [
            self.job_deployments,
            self.stream_deployments,
            self.streams,
        ];
        for collection in deployments.into_iter().flatten() {
            collection.close();
        }
    }
}

/// Leadership callback
struct LeaderTask {
    admin_id: String,
    paths: Paths,
    factory: Arc<dyn DeploymentListenerFactory>,
    membership: Arc<MembershipSlot>,
}

#[async_trait]
impl LeadershipListener for LeaderTask {
    async fn take_leadership(
        &self,
        client: Arc<dyn CoordinationClient>,
        revoked: CancellationToken,
    ) -> Result<()> {
        info!(admin_id = %self.admin_id, "Leader admin started");
        SupervisorMetrics::set_is_leader(true);

        let mut term = TermCollections::default();
        let result = tokio::select! {
            result = self.establish(&client, &mut term) => result,
            _ = revoked.cancelled() => Ok(()),
        };
        match &result {
            Ok(()) => revoked.cancelled().await,
            Err(e) => error!(admin_id = %self.admin_id, error = %e, "Leader admin failed to start"),
        }

        self.membership.store(None);
        term.close();
        SupervisorMetrics::set_is_leader(false);
        info!(admin_id = %self.admin_id, "Leader admin stopped");
        result
    }
}

impl LeaderTask {
    async fn establish(
        &self,
        client: &Arc<dyn CoordinationClient>,
        term: &mut TermCollections,
    ) -> Result<()> {
        let removed = cleanup_deployments(client.as_ref(), &self.paths).await?;
        if removed > 0 {
            info!(admin_id = %self.admin_id, removed, "Reconciled stale deployments");
        }

        let repository: Arc<dyn ContainerRepository> = Arc::new(MembershipView {
            membership: self.membership.clone(),
        });

        let streams = open(
            client,
            self.paths.streams(),
            "streams",
            RawConverter,
            None,
            StartMode::BuildInitialCache,
            &mut term.streams,
        )
        .await?;

        let stream_deployments = open(
            client,
            self.paths.stream_deployments(),
            "stream_deployments",
            RawConverter,
            Some(self.factory.stream_deployment_listener(repository.clone())),
            StartMode::PostInitializedEvent,
            &mut term.stream_deployments,
        )
        .await?;

        let job_deployments = open(
            client,
            self.paths.job_deployments(),
            "job_deployments",
            RawConverter,
            Some(self.factory.job_deployment_listener(repository.clone())),
            StartMode::PostInitializedEvent,
            &mut term.job_deployments,
        )
        .await?;

        let collections = DeploymentCollections {
            streams,
            stream_deployments,
            job_deployments,
        };
        let containers = open(
            client,
            self.paths.containers(),
            "containers",
            ContainerConverter,
            Some(self.factory.container_listener(repository, collections)),
            StartMode::Normal,
            &mut term.containers,
        )
        .await?;

        self.membership.store(Some(containers));
        debug!(admin_id = %self.admin_id, "Membership published");
        Ok(())
    }
}

/// Create a watched collection, record it for teardown, then start it
async fn open<C: ChildConverter>(
    client: &Arc<dyn CoordinationClient>,
    path: String,
    name: &str,
    converter: C,
    listener: Option<Arc<dyn ChildEventListener>>,
    mode: StartMode,
    slot: &mut Option<Arc<WatchedCollection<C>>>,
) -> Result<Arc<WatchedCollection<C>>> {
    let cache = PathChildrenCache::new(client.clone(), path, name);
    if let Some(listener) = listener {
        cache.add_listener(listener);
    }
    let collection = Arc::new(WatchedCollection::new(cache.clone(), converter));
    *slot = Some(collection.clone());
    cache.start(mode).await?;
    Ok(collection)
}
