//! Supervisor metrics
//!
//! Lightweight recorders built on the `metrics` crate with Prometheus export.
//! Every recorder compiles to nothing when the `metrics-prometheus` feature
//! is disabled.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dirt_cluster::observability::{init_metrics, SupervisorMetrics};
//!
//! // Initialize once at startup
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//!
//! SupervisorMetrics::set_is_leader(true);
//! ```

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Supervisor Metrics
// ============================================================================

/// Leadership and reconciliation metrics
pub struct SupervisorMetrics;

impl SupervisorMetrics {
    /// Leadership bids issued (initial start and every reconnect)
    pub fn increment_leadership_requests() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("dirt_supervisor_leadership_requests_total").increment(1);
    }

    /// Failed leadership bids
    pub fn increment_leadership_request_failures() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("dirt_supervisor_leadership_request_failures_total").increment(1);
    }

    /// Leadership terms started
    pub fn increment_leadership_acquired() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("dirt_supervisor_leadership_acquired_total").increment(1);
    }

    /// Whether this process leads (1 = yes, 0 = no)
    pub fn set_is_leader(is_leader: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("dirt_supervisor_is_leader").set(if is_leader { 1.0 } else { 0.0 });
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = is_leader;
    }

    /// Stale deployment subtrees removed during reconciliation
    pub fn add_stale_deployments_removed(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("dirt_supervisor_stale_deployments_removed_total")
            .increment(count as u64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = count;
    }

    /// Time spent in one reconciliation pass
    pub fn record_reconciliation_duration(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("dirt_supervisor_reconciliation_seconds")
            .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = duration;
    }
}

// ============================================================================
// Cache Metrics
// ============================================================================

/// Watched collection metrics, labelled by cache name
pub struct CacheMetrics;

impl CacheMetrics {
    /// Current number of cached children
    pub fn set_size(cache: &str, size: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("dirt_cache_size", "cache" => cache.to_string()).set(size as f64);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (cache, size);
    }

    /// Child events dispatched to listeners
    pub fn increment_events(cache: &str, kind: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("dirt_cache_events_total", "cache" => cache.to_string(), "kind" => kind)
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = (cache, kind);
    }

    /// Failed refreshes (retried on the next notification)
    pub fn increment_refresh_errors(cache: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("dirt_cache_refresh_errors_total", "cache" => cache.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = cache;
    }

    /// Listener invocations that returned an error
    pub fn increment_listener_errors(cache: &str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("dirt_cache_listener_errors_total", "cache" => cache.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = cache;
    }
}

// ============================================================================
// Connection Metrics
// ============================================================================

/// Coordination connection metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn set_connected(connected: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("dirt_connection_connected").set(if connected { 1.0 } else { 0.0 });
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = connected;
    }

    /// Connected/disconnected transitions observed
    pub fn increment_transitions(connected: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!(
            "dirt_connection_transitions_total",
            "to" => if connected { "connected" } else { "disconnected" }
        )
        .increment(1);
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = connected;
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Start a HTTP listener serving `/metrics`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem. Safe to call more than once; only the
/// first call installs an exporter.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = prometheus_addr;

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_metrics_compile() {
        SupervisorMetrics::increment_leadership_requests();
        SupervisorMetrics::set_is_leader(true);
        SupervisorMetrics::add_stale_deployments_removed(2);
        SupervisorMetrics::record_reconciliation_duration(Duration::from_millis(3));
    }

    #[test]
    fn test_cache_and_connection_metrics_compile() {
        CacheMetrics::set_size("containers", 3);
        CacheMetrics::increment_events("containers", "child_added");
        ConnectionMetrics::set_connected(false);
        ConnectionMetrics::increment_transitions(true);
    }

    #[test]
    fn test_init_without_exporter() {
        assert!(init_metrics(None).is_ok());
        assert!(init_metrics(None).is_ok());
    }
}
