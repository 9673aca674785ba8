//! Deployment supervisor against the in-memory coordination service
//!
//! - Leadership lifecycle (start, stop, disconnect, reconnect)
//! - Stale deployment reconciliation on takeover
//! - Listener wiring
//! - Failover between admin processes

use async_trait::async_trait;
use dirt_cluster::{
    ChildEvent, ChildEventListener, Container, ContainerRegistration, ContainerRepository,
    ConnectionMonitor, CoordinationClient, DeploymentCollections, DeploymentListenerFactory,
    DeploymentSupervisor, ElectionState, InMemoryClient, InMemoryCoordinator,
    LoggingListenerFactory, Paths, Result, SupervisorConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn admin(
    client: &Arc<InMemoryClient>,
    id: &str,
    factory: Arc<dyn DeploymentListenerFactory>,
) -> DeploymentSupervisor {
    let client: Arc<dyn CoordinationClient> = client.clone();
    let monitor = ConnectionMonitor::new(client.clone());
    let config = SupervisorConfig::builder()
        .admin_id(id)
        .election_retry(Duration::from_millis(20))
        .build()
        .unwrap();
    DeploymentSupervisor::new(client, monitor, factory, config).unwrap()
}

fn member_ids(supervisor: &DeploymentSupervisor) -> Vec<String> {
    supervisor
        .membership_snapshot()
        .iter()
        .map(|c| c.id)
        .collect()
}

/// Records every event per listener kind
#[derive(Default)]
struct Recording {
    events: Mutex<Vec<(&'static str, ChildEvent)>>,
    collections: Mutex<Option<DeploymentCollections>>,
}

impl Recording {
    fn saw(&self, source: &str, kind: &str, name: &str) -> bool {
        self.events.lock().iter().any(|(s, e)| {
            *s == source && e.kind() == kind && e.data().map(|d| d.name()) == Some(name)
        })
    }
}

struct RecordingListener {
    source: &'static str,
    recording: Arc<Recording>,
}

#[async_trait]
impl ChildEventListener for RecordingListener {
    async fn child_event(&self, _client: &dyn CoordinationClient, event: &ChildEvent) -> Result<()> {
        self.recording.events.lock().push((self.source, event.clone()));
        Ok(())
    }
}

struct RecordingFactory(Arc<Recording>);

impl RecordingFactory {
    fn listener(&self, source: &'static str) -> Arc<dyn ChildEventListener> {
        Arc::new(RecordingListener {
            source,
            recording: self.0.clone(),
        })
    }
}

impl DeploymentListenerFactory for RecordingFactory {
    fn stream_deployment_listener(
        &self,
        _containers: Arc<dyn ContainerRepository>,
    ) -> Arc<dyn ChildEventListener> {
        self.listener("streams")
    }

    fn job_deployment_listener(
        &self,
        _containers: Arc<dyn ContainerRepository>,
    ) -> Arc<dyn ChildEventListener> {
        self.listener("jobs")
    }

    fn container_listener(
        &self,
        _containers: Arc<dyn ContainerRepository>,
        collections: DeploymentCollections,
    ) -> Arc<dyn ChildEventListener> {
        *self.0.collections.lock() = Some(collections);
        self.listener("containers")
    }
}

#[tokio::test]
async fn test_empty_membership_when_not_leader() {
    let server = InMemoryCoordinator::new();
    let worker = server.connect();
    ContainerRegistration::register(worker.clone(), &Paths::default(), Container::new("c1"))
        .await
        .unwrap();

    let leader = admin(&server.connect(), "admin-1", Arc::new(LoggingListenerFactory));
    leader.start().await.unwrap();
    wait_until("leader", || leader.is_leader()).await;

    let follower = admin(&server.connect(), "admin-2", Arc::new(LoggingListenerFactory));
    follower.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(follower.state(), ElectionState::Contending);
    assert!(follower.membership_snapshot().is_empty());
    assert!(follower.find("c1").is_none());
    wait_until("leader membership", || member_ids(&leader) == vec!["c1"]).await;

    follower.stop().await.unwrap();
    leader.stop().await.unwrap();
}

#[tokio::test]
async fn test_membership_follows_registrations() {
    let server = InMemoryCoordinator::new();
    let paths = Paths::default();
    let supervisor = admin(&server.connect(), "admin-1", Arc::new(LoggingListenerFactory));
    supervisor.start().await.unwrap();
    wait_until("leader", || supervisor.is_leader()).await;
    assert!(supervisor.membership_snapshot().is_empty());

    let worker_a = server.connect();
    let worker_b = server.connect();
    ContainerRegistration::register(
        worker_a.clone(),
        &paths,
        Container::new("a").with_attribute("host", "node-a"),
    )
    .await
    .unwrap();
    ContainerRegistration::register(worker_b.clone(), &paths, Container::new("b"))
        .await
        .unwrap();
    wait_until("two members", || member_ids(&supervisor) == vec!["a", "b"]).await;
    assert_eq!(
        supervisor.find("a").and_then(|c| c.host().map(str::to_string)),
        Some("node-a".to_string())
    );

    // a crashed container disappears with its session
    worker_a.expire();
    wait_until("one member", || member_ids(&supervisor) == vec!["b"]).await;

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_takeover_reconciles_stale_deployments() {
    let server = InMemoryCoordinator::new();
    let seed = server.connect();
    let paths = Paths::default();

    for id in ["A", "B", "C"] {
        seed.ensure_path(&format!("{}/job.0", paths.container_deployments(id)))
            .await
            .unwrap();
    }
    let worker = server.connect();
    ContainerRegistration::register(worker.clone(), &paths, Container::new("B"))
        .await
        .unwrap();

    let supervisor = admin(&server.connect(), "admin-1", Arc::new(LoggingListenerFactory));
    supervisor.start().await.unwrap();
    wait_until("leader", || supervisor.is_leader()).await;
    wait_until("membership", || member_ids(&supervisor) == vec!["B"]).await;

    assert_eq!(
        seed.get_children(&paths.module_deployments()).await.unwrap(),
        vec!["B"]
    );
    assert_eq!(
        seed.get_children(&paths.container_deployments("B"))
            .await
            .unwrap(),
        vec!["job.0"]
    );

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_on_empty_namespace() {
    let server = InMemoryCoordinator::new();
    let supervisor = admin(&server.connect(), "admin-1", Arc::new(LoggingListenerFactory));

    supervisor.start().await.unwrap();
    wait_until("leader", || supervisor.is_leader()).await;
    for path in Paths::default().required() {
        assert!(server.contains(&path), "{path} not created");
    }
    assert!(supervisor.membership_snapshot().is_empty());

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let server = InMemoryCoordinator::new();
    let client = server.connect();
    let supervisor = admin(&client, "admin-1", Arc::new(LoggingListenerFactory));

    supervisor.stop().await.unwrap();
    supervisor.start().await.unwrap();
    wait_until("leader", || supervisor.is_leader()).await;

    supervisor.stop().await.unwrap();
    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), ElectionState::NotContending);
    assert!(supervisor.membership_snapshot().is_empty());
    assert!(client
        .get_children(&Paths::default().election())
        .await
        .unwrap()
        .is_empty());

    // no longer follows connection transitions
    client.suspend();
    client.resume();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(supervisor.state(), ElectionState::NotContending);
}

#[tokio::test]
async fn test_disconnect_releases_and_reconnect_resumes() {
    let server = InMemoryCoordinator::new();
    let client = server.connect();
    let worker = server.connect();
    ContainerRegistration::register(worker.clone(), &Paths::default(), Container::new("c1"))
        .await
        .unwrap();

    let supervisor = admin(&client, "admin-1", Arc::new(LoggingListenerFactory));
    supervisor.start().await.unwrap();
    wait_until("membership", || member_ids(&supervisor) == vec!["c1"]).await;

    client.suspend();
    wait_until("released", || {
        supervisor.state() == ElectionState::NotContending
    })
    .await;
    assert!(supervisor.membership_snapshot().is_empty());

    client.resume();
    wait_until("leading again", || supervisor.is_leader()).await;
    wait_until("membership again", || member_ids(&supervisor) == vec!["c1"]).await;

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_failover_between_admins() {
    let server = InMemoryCoordinator::new();
    let worker = server.connect();
    ContainerRegistration::register(worker.clone(), &Paths::default(), Container::new("c1"))
        .await
        .unwrap();

    let first_client = server.connect();
    let first = admin(&first_client, "admin-1", Arc::new(LoggingListenerFactory));
    first.start().await.unwrap();
    wait_until("first leads", || first.is_leader()).await;

    let second = admin(&server.connect(), "admin-2", Arc::new(LoggingListenerFactory));
    second.start().await.unwrap();
    assert!(!second.is_leader());

    first_client.expire();
    wait_until("second leads", || second.is_leader()).await;
    wait_until("second membership", || member_ids(&second) == vec!["c1"]).await;
    wait_until("first released", || first.membership_snapshot().is_empty()).await;
    assert_ne!(first.state(), ElectionState::Leading);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_listeners_receive_events() {
    let server = InMemoryCoordinator::new();
    let paths = Paths::default();
    let seed = server.connect();
    seed.ensure_path(&paths.job_deployments()).await.unwrap();
    seed.ensure_path(&format!("{}/existing", paths.job_deployments()))
        .await
        .unwrap();

    let recording = Arc::new(Recording::default());
    let supervisor = admin(
        &server.connect(),
        "admin-1",
        Arc::new(RecordingFactory(recording.clone())),
    );
    supervisor.start().await.unwrap();
    wait_until("leader", || supervisor.is_leader()).await;

    wait_until("initial job deployment", || {
        recording.saw("jobs", "child_added", "existing")
    })
    .await;
    wait_until("jobs initialized", || {
        recording
            .events
            .lock()
            .iter()
            .any(|(s, e)| *s == "jobs" && *e == ChildEvent::Initialized)
    })
    .await;

    seed.ensure_path(&format!("{}/ticktock", paths.stream_deployments()))
        .await
        .unwrap();
    wait_until("stream deployment", || {
        recording.saw("streams", "child_added", "ticktock")
    })
    .await;

    let worker = server.connect();
    ContainerRegistration::register(worker.clone(), &paths, Container::new("c7"))
        .await
        .unwrap();
    wait_until("container arrival", || {
        recording.saw("containers", "child_added", "c7")
    })
    .await;

    let collections = recording.collections.lock().clone().unwrap();
    assert_eq!(collections.job_deployments.len(), 1);
    assert_eq!(collections.stream_deployments.len(), 1);

    worker.expire();
    wait_until("container departure", || {
        recording.saw("containers", "child_removed", "c7")
    })
    .await;

    supervisor.stop().await.unwrap();
    // collections of the finished term are closed
    assert!(collections.job_deployments.is_empty());
    assert!(collections.job_deployments.cache().is_closed());
}

#[tokio::test]
async fn test_failed_bid_is_returned_and_retried_on_reconnect() {
    let server = InMemoryCoordinator::new();
    let client = server.connect();

    // an ephemeral namespace root cannot hold the required paths
    let blocker = server.connect();
    blocker
        .create("/xd", bytes::Bytes::new(), dirt_cluster::CreateMode::Ephemeral)
        .await
        .unwrap();

    let supervisor = admin(&client, "admin-1", Arc::new(LoggingListenerFactory));
    match supervisor.start().await {
        Err(dirt_cluster::ClusterError::LeadershipRequest(_)) => {}
        other => panic!("expected a failed leadership request, got {other:?}"),
    }

    // no retry until the next connect event
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.state(), ElectionState::NotContending);

    blocker.close();
    wait_until("namespace root released", || !server.contains("/xd")).await;
    client.suspend();
    client.resume();
    wait_until("leading after reconnect", || supervisor.is_leader()).await;

    supervisor.stop().await.unwrap();
}
