//! CLI argument parsing for the dirt admin daemon

use clap::Parser;
use dirt_cluster::node::attributes;
use dirt_cluster::{Container, SupervisorConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Get system hostname via the `hostname` command, falling back to "unknown".
fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_owned())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Parse a `key=value` container attribute
fn parse_attribute(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

/// dirtd - deployment supervisor for the dirt control plane
///
/// Contends for leadership among admin processes and, while leading, keeps
/// a live view of cluster membership and pending deployments.
#[derive(Parser, Debug)]
#[command(name = "dirtd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // ============ Supervisor Configuration ============
    /// Admin process identifier (random UUID when omitted)
    #[arg(long, env = "DIRT_ADMIN_ID")]
    pub admin_id: Option<String>,

    /// Root namespace for coordination paths
    #[arg(long, default_value = "xd", env = "DIRT_NAMESPACE")]
    pub namespace: String,

    /// Back-off after a failed election round, in milliseconds
    #[arg(long, default_value = "1000", env = "DIRT_ELECTION_RETRY_MS")]
    pub election_retry_ms: u64,

    // ============ Single-Node Container ============
    /// Do not register a local container
    #[arg(long, env = "DIRT_NO_LOCAL_CONTAINER")]
    pub no_local_container: bool,

    /// Local container id (defaults to the hostname)
    #[arg(long, env = "DIRT_CONTAINER_ID")]
    pub container_id: Option<String>,

    /// Extra local container attributes (comma-separated key=value)
    #[arg(
        long = "container-attribute",
        value_delimiter = ',',
        value_parser = parse_attribute,
        env = "DIRT_CONTAINER_ATTRIBUTES"
    )]
    pub container_attributes: Vec<(String, String)>,

    // ============ Observability ============
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Prometheus metrics listener address
    #[arg(long, env = "DIRT_METRICS_BIND")]
    pub metrics_bind: Option<SocketAddr>,

    /// Interval between status log lines, in seconds (0 disables)
    #[arg(long, default_value = "30", env = "DIRT_STATUS_INTERVAL_SECS")]
    pub status_interval_secs: u64,
}

impl Cli {
    /// Build the supervisor configuration
    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig {
            namespace: self.namespace.clone(),
            election_retry: Duration::from_millis(self.election_retry_ms),
            ..Default::default()
        };
        if let Some(id) = &self.admin_id {
            config.admin_id = id.clone();
        }
        config
    }

    /// Container registered in single-node mode, if enabled
    pub fn local_container(&self) -> Option<Container> {
        if self.no_local_container {
            return None;
        }
        let host = hostname();
        let id = self.container_id.clone().unwrap_or_else(|| host.clone());
        let mut container = Container::new(id)
            .with_attribute(attributes::HOST, host)
            .with_attribute(attributes::PID, std::process::id().to_string());
        for (key, value) in &self.container_attributes {
            container = container.with_attribute(key.clone(), value.clone());
        }
        Some(container)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.to_supervisor_config()
            .validate()
            .map_err(|e| e.to_string())?;

        if let Some(id) = &self.container_id {
            if id.is_empty() || id.contains('/') {
                return Err(format!(
                    "container_id must be a single non-empty path segment, got '{id}'"
                ));
            }
        }
        Ok(())
    }
}
