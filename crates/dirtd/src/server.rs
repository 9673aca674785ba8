//! Admin server
//!
//! Hosts one deployment supervisor. In single-node mode the coordination
//! service is embedded in the process and a local container registers
//! itself, so a lone admin leads immediately and sees one member.

use crate::cli::Cli;
use dirt_cluster::{
    init_metrics, ConnectionMonitor, ContainerRegistration, CoordinationClient,
    DeploymentSupervisor, InMemoryClient, InMemoryCoordinator, LoggingListenerFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Single-node admin server
pub struct AdminServer {
    cli: Cli,
    coordinator: InMemoryCoordinator,
    client: Arc<InMemoryClient>,
    supervisor: DeploymentSupervisor,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl AdminServer {
    pub async fn new(cli: Cli) -> anyhow::Result<Self> {
        cli.validate()
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

        let coordinator = InMemoryCoordinator::new();
        let client = coordinator.connect();
        let coordination: Arc<dyn CoordinationClient> = client.clone();
        let monitor = ConnectionMonitor::new(coordination.clone());
        let supervisor = DeploymentSupervisor::new(
            coordination,
            monitor,
            Arc::new(LoggingListenerFactory),
            cli.to_supervisor_config(),
        )?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Ok(Self {
            cli,
            coordinator,
            client,
            supervisor,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn supervisor(&self) -> &DeploymentSupervisor {
        &self.supervisor
    }

    /// Run until shutdown is requested, then release leadership
    pub async fn start(self) -> anyhow::Result<()> {
        let Self {
            cli,
            coordinator,
            client,
            supervisor,
            mut shutdown_rx,
            ..
        } = self;

        init_metrics(cli.metrics_bind)
            .map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;

        // the container gets its own session, as a separate process would
        let registration = match cli.local_container() {
            Some(container) => Some(
                ContainerRegistration::register(coordinator.connect(), supervisor.paths(), container)
                    .await?,
            ),
            None => None,
        };

        supervisor.start().await?;
        info!(
            admin_id = %supervisor.id(),
            session = client.session_id(),
            "Admin server started"
        );

        let mut status = (cli.status_interval_secs > 0)
            .then(|| tokio::time::interval(Duration::from_secs(cli.status_interval_secs)));
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = async {
                    match status.as_mut() {
                        Some(interval) => { interval.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => log_status(&supervisor),
            }
        }

        info!("Stopping deployment supervisor");
        supervisor.stop().await?;
        if let Some(registration) = registration {
            if let Err(e) = registration.deregister().await {
                warn!(error = %e, "Failed to deregister local container");
            }
        }
        client.close();
        Ok(())
    }

    /// Get a shutdown handle that can be used to trigger shutdown from outside
    pub fn get_shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }
}

/// Handle for triggering server shutdown from outside
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn log_status(supervisor: &DeploymentSupervisor) {
    info!(
        state = ?supervisor.state(),
        containers = supervisor.membership_snapshot().len(),
        "Admin status"
    );
}
