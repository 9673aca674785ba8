//! Single-node admin server lifecycle

use clap::Parser;
use dirtd::{AdminServer, Cli};
use std::time::Duration;

#[tokio::test]
async fn test_single_node_leads_and_sees_local_container() {
    let cli = Cli::parse_from([
        "dirtd",
        "--admin-id",
        "admin-test",
        "--container-id",
        "local-1",
        "--election-retry-ms",
        "50",
        "--status-interval-secs",
        "0",
    ]);
    let server = AdminServer::new(cli).await.unwrap();
    let supervisor = server.supervisor().clone();
    let shutdown = server.get_shutdown_handle();
    let handle = tokio::spawn(server.start());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let members = supervisor.membership_snapshot();
        if supervisor.is_leader() && members.len() == 1 {
            let ids: Vec<_> = members.iter().map(|c| c.id).collect();
            assert_eq!(ids, vec!["local-1".to_string()]);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never led with one member");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert!(!supervisor.is_leader());
    assert!(supervisor.membership_snapshot().is_empty());
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let cli = Cli::parse_from(["dirtd", "--namespace", ""]);
    assert!(AdminServer::new(cli).await.is_err());
}
