//! Downstream listener contract
//!
//! The leader wires three listeners into its watched collections: one for
//! stream deployment requests, one for job deployment requests, and one for
//! container arrivals and departures. What they do with the events (module
//! placement, redeployment) lives outside this crate; hosts provide a
//! [`DeploymentListenerFactory`] holding whatever repositories they need.

use crate::cache::{ChildEvent, ChildEventListener};
use crate::collection::{ContainerConverter, RawConverter, Snapshot, WatchedCollection};
use crate::coordination::CoordinationClient;
use crate::error::Result;
use crate::node::Container;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Read access to live cluster membership
pub trait ContainerRepository: Send + Sync {
    /// Current membership; empty while this process is not leading
    fn containers(&self) -> Snapshot<ContainerConverter>;

    fn find(&self, id: &str) -> Option<Container> {
        self.containers().iter().find(|c| c.id == id)
    }
}

/// Collections handed to the container listener, which redeploys their
/// entries when membership changes
#[derive(Clone)]
pub struct DeploymentCollections {
    pub streams: Arc<WatchedCollection<RawConverter>>,
    pub stream_deployments: Arc<WatchedCollection<RawConverter>>,
    pub job_deployments: Arc<WatchedCollection<RawConverter>>,
}

/// Builds the listeners attached for each leadership term
pub trait DeploymentListenerFactory: Send + Sync + 'static {
    fn stream_deployment_listener(
        &self,
        containers: Arc<dyn ContainerRepository>,
    ) -> Arc<dyn ChildEventListener>;

    fn job_deployment_listener(
        &self,
        containers: Arc<dyn ContainerRepository>,
    ) -> Arc<dyn ChildEventListener>;

    fn container_listener(
        &self,
        containers: Arc<dyn ContainerRepository>,
        collections: DeploymentCollections,
    ) -> Arc<dyn ChildEventListener>;
}

/// Factory for [`LoggingListener`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListenerFactory;

impl DeploymentListenerFactory for LoggingListenerFactory {
    fn stream_deployment_listener(
        &self,
        containers: Arc<dyn ContainerRepository>,
    ) -> Arc<dyn ChildEventListener> {
        Arc::new(LoggingListener::new("stream_deployments", containers))
    }

    fn job_deployment_listener(
        &self,
        containers: Arc<dyn ContainerRepository>,
    ) -> Arc<dyn ChildEventListener> {
        Arc::new(LoggingListener::new("job_deployments", containers))
    }

    fn container_listener(
        &self,
        containers: Arc<dyn ContainerRepository>,
        collections: DeploymentCollections,
    ) -> Arc<dyn ChildEventListener> {
        debug!(
            streams = collections.streams.len(),
            stream_deployments = collections.stream_deployments.len(),
            job_deployments = collections.job_deployments.len(),
            "Container listener attached"
        );
        Arc::new(LoggingListener::new("containers", containers))
    }
}

/// Logs every event it receives
pub struct LoggingListener {
    source: &'static str,
    containers: Arc<dyn ContainerRepository>,
}

impl LoggingListener {
    pub fn new(source: &'static str, containers: Arc<dyn ContainerRepository>) -> Self {
        Self { source, containers }
    }
}

#[async_trait]
impl ChildEventListener for LoggingListener {
    async fn child_event(
        &self,
        _client: &dyn CoordinationClient,
        event: &ChildEvent,
    ) -> Result<()> {
        match event.data() {
            Some(child) => info!(
                source = self.source,
                event = event.kind(),
                path = %child.path,
                containers = self.containers.containers().len(),
                "Deployment event"
            ),
            None => debug!(source = self.source, event = event.kind(), "Deployment event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChildData;
    use crate::coordination::InMemoryCoordinator;
    use crate::coordination::Stat;
    use bytes::Bytes;

    struct NoContainers;

    impl ContainerRepository for NoContainers {
        fn containers(&self) -> Snapshot<ContainerConverter> {
            Snapshot::empty()
        }
    }

    #[tokio::test]
    async fn test_logging_listener_accepts_events() {
        let server = InMemoryCoordinator::new();
        let client = server.connect();
        let factory = LoggingListenerFactory;
        let listener = factory.job_deployment_listener(Arc::new(NoContainers));

        let event = ChildEvent::ChildAdded(ChildData {
            path: "/xd/deployments/jobs/j1".to_string(),
            stat: Stat::default(),
            data: Bytes::new(),
        });
        listener.child_event(&*client, &event).await.unwrap();
        listener
            .child_event(&*client, &ChildEvent::Initialized)
            .await
            .unwrap();
    }

    #[test]
    fn test_find_on_empty_repository() {
        assert!(NoContainers.find("c1").is_none());
    }
}
