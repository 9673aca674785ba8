//! Connection monitor
//!
//! Collapses the coordination client's connection states into a
//! connected/disconnected signal and fans each transition out to registered
//! listeners, once per transition.

use crate::coordination::{ConnectionState, CoordinationClient};
use crate::observability::ConnectionMetrics;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle returned by [`ConnectionMonitor::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receives connection transitions
#[async_trait]
pub trait ConnectionListener: Send + Sync + 'static {
    async fn on_connect(&self, client: &Arc<dyn CoordinationClient>);

    async fn on_disconnect(&self, client: &Arc<dyn CoordinationClient>);
}

/// Connection state tracker and listener fan-out
pub struct ConnectionMonitor {
    client: Arc<dyn CoordinationClient>,
    listeners: DashMap<ListenerId, Arc<dyn ConnectionListener>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnectionMonitor {
    /// Create a monitor and spawn its dispatcher. Must be called within a
    /// tokio runtime.
    pub fn new(client: Arc<dyn CoordinationClient>) -> Arc<Self> {
        // subscribe before sampling so no transition falls in between
        let events = client.connection_events();
        let connected = client.is_connected();
        ConnectionMetrics::set_connected(connected);

        let monitor = Arc::new(Self {
            client,
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(connected),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::dispatch(
            Arc::downgrade(&monitor),
            events,
            monitor.shutdown.clone(),
        ));
        monitor
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    /// Last observed connection state
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, listener);
        id
    }

    /// Returns `false` if the listener was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Stop dispatching; registered listeners receive nothing further
    pub fn close(&self) {
        self.shutdown.cancel();
        self.listeners.clear();
    }

    async fn dispatch(
        monitor: Weak<Self>,
        mut events: tokio::sync::broadcast::Receiver<ConnectionState>,
        shutdown: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => received,
            };

            let Some(monitor) = monitor.upgrade() else {
                break;
            };
            let connected = match received {
                Ok(state) => {
                    debug!(?state, "Coordination connection state changed");
                    state.is_connected()
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection events lagged, resampling state");
                    monitor.client.is_connected()
                }
                Err(RecvError::Closed) => break,
            };
            monitor.transition(connected).await;
        }
        debug!("Connection monitor stopped");
    }

    async fn transition(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::AcqRel) == connected {
            return;
        }
        ConnectionMetrics::set_connected(connected);
        ConnectionMetrics::increment_transitions(connected);
        info!(connected, "Coordination connection transition");

        let listeners: Vec<Arc<dyn ConnectionListener>> = self
            .listeners
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for listener in listeners {
            if self.shutdown.is_cancelled() {
                return;
            }
            if connected {
                listener.on_connect(&self.client).await;
            } else {
                listener.on_disconnect(&self.client).await;
            }
        }
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
