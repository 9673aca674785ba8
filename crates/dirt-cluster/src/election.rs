//! Leader election
//!
//! Contenders create ephemeral sequential latch nodes under a shared election
//! path. The owner of the lowest sequence leads; everyone else watches the
//! latch immediately ahead of its own, so a leader's departure wakes exactly
//! one successor.
//!
//! A leadership term runs [`LeadershipListener::take_leadership`] with a
//! revocation token. The token fires when the connection is suspended or
//! lost, or when the elector is closed. The elector keeps driving the
//! callback until it returns, so teardown always completes before the latch
//! is released. When the callback returns the elector contends again.

use crate::coordination::{ConnectionState, CoordinationClient, CreateMode, WatchEventKind};
use crate::error::{ClusterError, Result};
use crate::observability::SupervisorMetrics;
use crate::paths;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LATCH_PREFIX: &str = "latch-";

/// Elector state as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    NotContending,
    Contending,
    Leading,
}

/// Leadership callback
#[async_trait]
pub trait LeadershipListener: Send + Sync + 'static {
    /// Runs while this process leads. Return after `revoked` fires, once
    /// everything opened for the term is released.
    async fn take_leadership(
        &self,
        client: Arc<dyn CoordinationClient>,
        revoked: CancellationToken,
    ) -> Result<()>;
}

struct Shared {
    id: String,
    path: String,
    client: Arc<dyn CoordinationClient>,
    listener: Arc<dyn LeadershipListener>,
    retry: Duration,
    state: RwLock<ElectionState>,
    shutdown: CancellationToken,
}

/// Leader elector over a coordination path
pub struct LeaderElector {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        id: impl Into<String>,
        listener: Arc<dyn LeadershipListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                path: path.into(),
                client,
                listener,
                retry: Duration::from_secs(1),
                state: RwLock::new(ElectionState::NotContending),
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Back-off after a failed contention round
    pub fn with_retry(mut self, retry: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.retry = retry;
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn state(&self) -> ElectionState {
        *self.shared.state.read()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leading
    }

    /// Begin contending. Idempotent while running; fails once closed.
    pub fn start(&self) -> Result<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ClusterError::InvalidState("elector closed".to_string()));
        }
        let mut task = self.task.lock();
        if task.is_none() {
            self.shared.set_state(ElectionState::Contending);
            *task = Some(tokio::spawn(self.shared.clone().run()));
            debug!(id = %self.shared.id, path = %self.shared.path, "Leader elector started");
        }
        Ok(())
    }

    /// Id recorded in the current leader's latch, if any
    pub async fn leader_id(&self) -> Result<Option<String>> {
        let latches = match self.shared.latches().await {
            Ok(latches) => latches,
            Err(e) if e.is_no_node() => return Ok(None),
            Err(e) => return Err(e),
        };
        for latch in latches {
            match self
                .shared
                .client
                .get_data(&paths::join(&self.shared.path, &latch))
                .await
            {
                Ok((data, _)) => return Ok(Some(String::from_utf8(data.to_vec())?)),
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Stop contending and wait for any running term to finish its teardown.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.shared.shutdown.cancel();
        let task = self.task.lock().take();
        let result = match task {
            Some(task) => task.await.map_err(ClusterError::from),
            None => Ok(()),
        };
        self.shared.set_state(ElectionState::NotContending);
        result
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn set_state(&self, state: ElectionState) {
        *self.state.write() = state;
    }

    async fn run(self: Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            match self.contend().await {
                Ok(()) => {}
                Err(ClusterError::ShuttingDown) => break,
                Err(e) => {
                    warn!(id = %self.id, error = %e, "Leader election round failed, retrying");
                    self.set_state(ElectionState::Contending);
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        self.set_state(ElectionState::NotContending);
        debug!(id = %self.id, "Leader elector stopped");
    }

    /// One contention round: create a latch, wait for it to come first,
    /// lead, then release the latch
    async fn contend(&self) -> Result<()> {
        self.set_state(ElectionState::Contending);
        let mut events = self.client.connection_events();
        self.wait_connected(&mut events).await?;

        self.client.ensure_path(&self.path).await?;
        self.purge_own_latches().await?;

        let latch = self
            .client
            .create(
                &paths::join(&self.path, LATCH_PREFIX),
                Bytes::from(self.id.clone()),
                CreateMode::EphemeralSequential,
            )
            .await?;
        debug!(id = %self.id, latch = %latch, "Created election latch");

        let result = self.hold(&latch, &mut events).await;

        match self.client.delete(&latch).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {}
            Err(e) => {
                // removed by the next round, or with the session
                debug!(latch = %latch, error = %e, "Failed to release election latch");
            }
        }
        result
    }

    async fn hold(
        &self,
        latch: &str,
        events: &mut broadcast::Receiver<ConnectionState>,
    ) -> Result<()> {
        let name = paths::strip_path(latch);
        loop {
            let latches = self.latches().await?;
            let position = latches
                .iter()
                .position(|l| l == name)
                .ok_or_else(|| ClusterError::Election(format!("latch {latch} vanished")))?;

            if position == 0 {
                return self.lead(events).await;
            }

            let predecessor = paths::join(&self.path, &latches[position - 1]);
            let mut watch = self.client.watch(&predecessor)?;
            if self.client.exists(&predecessor).await?.is_none() {
                continue;
            }
            debug!(id = %self.id, predecessor = %predecessor, "Waiting for predecessor");

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(ClusterError::ShuttingDown),
                    event = watch.recv() => match event {
                        Some(event) if event.path == predecessor && event.kind == WatchEventKind::NodeDeleted => {
                            break
                        }
                        Some(_) => {}
                        None => return Err(ClusterError::Closed),
                    },
                    state = events.recv() => {
                        if !self.still_connected(state) {
                            return Err(ClusterError::ConnectionLoss);
                        }
                    }
                }
            }
        }
    }

    async fn lead(&self, events: &mut broadcast::Receiver<ConnectionState>) -> Result<()> {
        self.set_state(ElectionState::Leading);
        SupervisorMetrics::increment_leadership_acquired();
        info!(id = %self.id, path = %self.path, "Leadership acquired");

        let revoked = self.shutdown.child_token();
        let term = self
            .listener
            .take_leadership(self.client.clone(), revoked.clone());
        tokio::pin!(term);

        let result = loop {
            tokio::select! {
                result = &mut term => break result,
                state = events.recv(), if !revoked.is_cancelled() => {
                    if !self.still_connected(state) {
                        info!(id = %self.id, "Connection interrupted, revoking leadership");
                        revoked.cancel();
                    }
                }
            }
        };

        self.set_state(ElectionState::Contending);
        info!(id = %self.id, "Leadership relinquished");
        result
    }

    async fn wait_connected(&self, events: &mut broadcast::Receiver<ConnectionState>) -> Result<()> {
        while !self.client.is_connected() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ClusterError::ShuttingDown),
                state = events.recv() => match state {
                    Ok(state) if state.is_connected() => return Ok(()),
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(ClusterError::Closed),
                },
            }
        }
        if self.shutdown.is_cancelled() {
            return Err(ClusterError::ShuttingDown);
        }
        Ok(())
    }

    fn still_connected(&self, state: std::result::Result<ConnectionState, RecvError>) -> bool {
        match state {
            Ok(state) => state.is_connected(),
            Err(RecvError::Lagged(_)) => self.client.is_connected(),
            Err(RecvError::Closed) => false,
        }
    }

    /// Latch names in election order
    async fn latches(&self) -> Result<Vec<String>> {
        let mut latches: Vec<String> = self
            .client
            .get_children(&self.path)
            .await?
            .into_iter()
            .filter(|c| c.starts_with(LATCH_PREFIX))
            .collect();
        latches.sort_by(|a, b| sequence(a).cmp(&sequence(b)).then_with(|| a.cmp(b)));
        Ok(latches)
    }

    /// Remove latches this session left behind when an earlier release
    /// failed. An elector assumes it is the only contender on its session.
    async fn purge_own_latches(&self) -> Result<()> {
        let session = self.client.session_id();
        for latch in self.latches().await? {
            let path = paths::join(&self.path, &latch);
            let owned = match self.client.exists(&path).await? {
                Some(stat) => stat.ephemeral_owner == Some(session),
                None => false,
            };
            if owned {
                match self.client.delete(&path).await {
                    Ok(()) => debug!(latch = %path, "Removed stale election latch"),
                    Err(e) if e.is_no_node() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

fn sequence(latch: &str) -> u64 {
    latch
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct HoldUntilRevoked {
        terms: AtomicUsize,
    }

    #[async_trait]
    impl LeadershipListener for HoldUntilRevoked {
        async fn take_leadership(
            &self,
            _client: Arc<dyn CoordinationClient>,
            revoked: CancellationToken,
        ) -> Result<()> {
            self.terms.fetch_add(1, Ordering::SeqCst);
            revoked.cancelled().await;
            Ok(())
        }
    }

    async fn wait_for(elector: &LeaderElector, state: ElectionState) {
        for _ in 0..100 {
            if elector.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("elector never reached {state:?}");
    }

    #[test]
    fn test_latch_ordering() {
        assert!(sequence("latch-0000000002") < sequence("latch-0000000010"));
        assert_eq!(sequence("garbage"), u64::MAX);
    }

    #[tokio::test]
    async fn test_single_contender_leads() {
        let server = InMemoryCoordinator::new();
        let client = server.connect();
        let listener = Arc::new(HoldUntilRevoked {
            terms: AtomicUsize::new(0),
        });
        let elector = LeaderElector::new(client.clone(), "/xd/admin", "admin-1", listener.clone());
        assert_eq!(elector.state(), ElectionState::NotContending);

        elector.start().unwrap();
        elector.start().unwrap();
        wait_for(&elector, ElectionState::Leading).await;
        assert_eq!(elector.leader_id().await.unwrap().as_deref(), Some("admin-1"));

        elector.close().await.unwrap();
        assert_eq!(elector.state(), ElectionState::NotContending);
        assert_eq!(listener.terms.load(Ordering::SeqCst), 1);
        assert!(client.get_children("/xd/admin").await.unwrap().is_empty());
        assert!(elector.start().is_err());
    }

    #[tokio::test]
    async fn test_suspension_revokes_and_recontends() {
        let server = InMemoryCoordinator::new();
        let client = server.connect();
        let listener = Arc::new(HoldUntilRevoked {
            terms: AtomicUsize::new(0),
        });
        let elector = LeaderElector::new(client.clone(), "/xd/admin", "admin-1", listener.clone())
            .with_retry(Duration::from_millis(10));
        elector.start().unwrap();
        wait_for(&elector, ElectionState::Leading).await;

        client.suspend();
        wait_for(&elector, ElectionState::Contending).await;

        client.resume();
        wait_for(&elector, ElectionState::Leading).await;
        assert_eq!(listener.terms.load(Ordering::SeqCst), 2);
        // the latch left behind while suspended was purged
        assert_eq!(client.get_children("/xd/admin").await.unwrap().len(), 1);

        elector.close().await.unwrap();
    }
}
