//! dirtd - deployment supervisor daemon
//!
//! Usage:
//!   # Single node (embedded coordination service, local container)
//!   dirtd
//!
//!   # With custom configuration
//!   dirtd --admin-id admin-1 \
//!     --namespace staging \
//!     --container-id worker-1 \
//!     --container-attribute groups=gpu \
//!     --metrics-bind 0.0.0.0:9090

use clap::Parser;
use dirtd::{AdminServer, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing with configured log level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner(&cli);

    // validates the configuration
    let server = AdminServer::new(cli).await?;
    let shutdown = server.get_shutdown_handle();

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        shutdown.shutdown();
    });

    let server_handle = tokio::spawn(server.start());

    match server_handle.await {
        Ok(Ok(())) => tracing::info!("Server shut down gracefully"),
        Ok(Err(e)) => {
            tracing::error!("Server error: {}", e);
            return Err(e);
        }
        Err(e) => tracing::error!("Server task panicked: {}", e),
    }

    tracing::info!("Goodbye!");
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

fn print_banner(cli: &Cli) {
    let admin_id = cli.admin_id.as_deref().unwrap_or("auto");
    let container = if cli.no_local_container {
        "none".to_string()
    } else {
        cli.container_id.clone().unwrap_or_else(|| "hostname".to_string())
    };
    let metrics = cli
        .metrics_bind
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "disabled".to_string());

    eprintln!(
        r#"
     _ _      _      _
  __| (_)_ __| |_ __| |
 / _` | | '__| __/ _` |
| (_| | | |  | || (_| |
 \__,_|_|_|   \__\__,_|

Deployment Supervisor

  Admin ID:     {}
  Namespace:    {}
  Container:    {}
  Metrics:      {}
"#,
        admin_id, cli.namespace, container, metrics
    );
}
