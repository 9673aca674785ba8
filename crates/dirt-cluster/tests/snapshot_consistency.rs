//! Membership snapshots read from plain threads while containers come and go

use dirt_cluster::{
    Container, ContainerRegistration, ContainerRepository, ConnectionMonitor, CoordinationClient,
    DeploymentSupervisor, InMemoryCoordinator, LoggingListenerFactory, Paths, SupervisorConfig,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn host_of(id: &str) -> String {
    format!("host-{id}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshots_stay_consistent_under_churn() {
    let server = InMemoryCoordinator::new();
    let paths = Paths::default();

    let client: Arc<dyn CoordinationClient> = server.connect();
    let monitor = ConnectionMonitor::new(client.clone());
    let config = SupervisorConfig::builder().admin_id("admin-1").build().unwrap();
    let supervisor = DeploymentSupervisor::new(
        client,
        monitor,
        Arc::new(LoggingListenerFactory),
        config,
    )
    .unwrap();
    supervisor.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !supervisor.is_leader() {
        assert!(tokio::time::Instant::now() < deadline, "never became leader");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let worker = server.connect();
    let stop = Arc::new(AtomicBool::new(false));

    // readers on plain threads, never touching the runtime
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let supervisor = supervisor.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut snapshots = 0usize;
                while !stop.load(Ordering::Acquire) {
                    let snapshot = supervisor.containers();
                    let mut seen = HashSet::new();
                    for container in &snapshot {
                        assert_eq!(container.host(), Some(host_of(&container.id).as_str()));
                        assert!(seen.insert(container.id.clone()), "duplicate {}", container.id);
                    }
                    // a snapshot iterates the same generation every time
                    assert_eq!(snapshot.iter().count(), seen.len());
                    snapshots += 1;
                }
                snapshots
            })
        })
        .collect();

    for round in 0..20 {
        let mut registrations = Vec::new();
        for i in 0..10 {
            let id = format!("c{round}-{i}");
            let container = Container::new(id.clone()).with_attribute("host", host_of(&id));
            registrations.push(
                ContainerRegistration::register(worker.clone(), &paths, container)
                    .await
                    .unwrap(),
            );
        }
        tokio::task::yield_now().await;
        for registration in registrations.into_iter().step_by(2) {
            registration.deregister().await.unwrap();
        }
    }

    stop.store(true, Ordering::Release);
    for reader in readers {
        let snapshots = reader.join().expect("reader panicked");
        assert!(snapshots > 0);
    }

    // 5 survivors per round
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while supervisor.membership_snapshot().iter().count() != 100 {
        assert!(tokio::time::Instant::now() < deadline, "membership never settled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    supervisor.stop().await.unwrap();
    assert!(supervisor.membership_snapshot().is_empty());
}
