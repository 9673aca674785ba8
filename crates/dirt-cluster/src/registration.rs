//! Container registration
//!
//! A container announces itself with an ephemeral node named after its id.
//! The node lives as long as the container's coordination session.

use crate::coordination::{CoordinationClient, CreateMode};
use crate::error::Result;
use crate::node::{encode_attributes, Container};
use crate::paths::Paths;
use std::sync::Arc;
use tracing::{debug, info};

/// A container's live registration
pub struct ContainerRegistration {
    client: Arc<dyn CoordinationClient>,
    path: String,
    container: Container,
}

impl std::fmt::Debug for ContainerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistration")
            .field("path", &self.path)
            .field("container", &self.container)
            .finish()
    }
}

impl ContainerRegistration {
    /// Create the container's ephemeral node. Fails with `NodeExists` when a
    /// live container already uses the id.
    pub async fn register(
        client: Arc<dyn CoordinationClient>,
        paths: &Paths,
        container: Container,
    ) -> Result<Self> {
        client.ensure_path(&paths.containers()).await?;
        let path = client
            .create(
                &paths.container(&container.id),
                encode_attributes(&container.attributes),
                CreateMode::Ephemeral,
            )
            .await?;
        info!(container = %container.id, path = %path, "Container registered");
        Ok(Self {
            client,
            path,
            container,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Publish a new attribute set
    pub async fn update(&mut self, container: Container) -> Result<()> {
        self.client
            .set_data(&self.path, encode_attributes(&container.attributes))
            .await?;
        self.container.attributes = container.attributes;
        debug!(container = %self.container.id, "Container attributes updated");
        Ok(())
    }

    /// Remove the node; an already expired registration is not an error
    pub async fn deregister(self) -> Result<()> {
        match self.client.delete(&self.path).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e),
        }
        info!(container = %self.container.id, "Container deregistered");
        Ok(())
    }
}
