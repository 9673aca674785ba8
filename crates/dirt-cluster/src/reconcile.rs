//! Stale deployment reconciliation
//!
//! Module deployments are recorded beneath the id of the container they
//! were assigned to. A container that died while no admin was leading
//! leaves its assignments behind; a new leader removes them before it
//! starts reacting to membership changes.

use crate::coordination::CoordinationClient;
use crate::error::Result;
use crate::observability::SupervisorMetrics;
use crate::paths::Paths;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Container ids holding assignments but no longer registered
pub fn stale_containers<'a>(
    assigned: impl IntoIterator<Item = &'a str>,
    live: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<&'a str> {
    let live: BTreeSet<&str> = live.into_iter().collect();
    assigned
        .into_iter()
        .filter(|id| !live.contains(id))
        .collect()
}

/// Delete the deployment subtree of every container that is no longer
/// registered. Returns the number of subtrees removed.
pub async fn cleanup_deployments(client: &dyn CoordinationClient, paths: &Paths) -> Result<usize> {
    let started = Instant::now();
    let deployments = paths.module_deployments();

    let assigned = match client.get_children(&deployments).await {
        Ok(children) => children,
        Err(e) if e.is_no_node() => {
            debug!(path = %deployments, "No module deployments recorded");
            return Ok(0);
        }
        Err(e) => return Err(e),
    };
    if assigned.is_empty() {
        return Ok(0);
    }

    let containers = paths.containers();
    let live = match client.get_children(&containers).await {
        Ok(children) => children,
        Err(e) if e.is_no_node() => {
            // assignments are only ever written for registered containers
            warn!(
                path = %containers,
                assigned = assigned.len(),
                "Containers path missing while deployments exist, treating all as stale"
            );
            Vec::new()
        }
        Err(e) => return Err(e),
    };

    let stale = stale_containers(
        assigned.iter().map(String::as_str),
        live.iter().map(String::as_str),
    );
    for id in &stale {
        let path = paths.container_deployments(id);
        client.delete_recursive(&path).await?;
        info!(container = %id, path = %path, "Removed deployments of departed container");
    }

    SupervisorMetrics::add_stale_deployments_removed(stale.len());
    SupervisorMetrics::record_reconciliation_duration(started.elapsed());
    Ok(stale.len())
}
