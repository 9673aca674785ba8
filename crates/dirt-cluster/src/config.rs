//! Supervisor configuration

use crate::error::{ClusterError, Result};
use crate::paths::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deployment supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Admin process identifier (unique across the fleet), stored in the
    /// election latch
    pub admin_id: String,

    /// Root namespace for every coordination path
    pub namespace: String,

    /// Back-off after a failed contention round
    pub election_retry: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            admin_id: uuid::Uuid::new_v4().to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            election_retry: Duration::from_secs(1),
        }
    }
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.admin_id.trim().is_empty() {
            return Err(ClusterError::InvalidConfig(
                "admin_id must not be empty".to_string(),
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(ClusterError::InvalidConfig(format!(
                "namespace must be a single non-empty path segment, got '{}'",
                self.namespace
            )));
        }
        if self.election_retry.is_zero() {
            return Err(ClusterError::InvalidConfig(
                "election_retry must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for supervisor configuration
#[derive(Debug, Default)]
pub struct SupervisorConfigBuilder {
    admin_id: Option<String>,
    namespace: Option<String>,
    election_retry: Option<Duration>,
}

impl SupervisorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admin_id(mut self, id: impl Into<String>) -> Self {
        self.admin_id = Some(id.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn election_retry(mut self, retry: Duration) -> Self {
        self.election_retry = Some(retry);
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<SupervisorConfig> {
        let defaults = SupervisorConfig::default();
        let config = SupervisorConfig {
            admin_id: self.admin_id.unwrap_or(defaults.admin_id),
            namespace: self.namespace.unwrap_or(defaults.namespace),
            election_retry: self.election_retry.unwrap_or(defaults.election_retry),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.namespace, "xd");
        assert_eq!(config.election_retry, Duration::from_secs(1));
        assert!(uuid::Uuid::parse_str(&config.admin_id).is_ok());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SupervisorConfig::builder()
            .admin_id("admin-1")
            .namespace("staging")
            .election_retry(Duration::from_millis(50))
            .build()
            .unwrap();
        assert_eq!(config.admin_id, "admin-1");
        assert_eq!(config.namespace, "staging");
    }

    #[test]
    fn test_invalid_config() {
        assert!(SupervisorConfig::builder().admin_id(" ").build().is_err());
        assert!(SupervisorConfig::builder().namespace("a/b").build().is_err());
        assert!(SupervisorConfig::builder()
            .election_retry(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"admin_id":"a1","namespace":"prod"}"#).unwrap();
        assert_eq!(config.admin_id, "a1");
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.election_retry, Duration::from_secs(1));
    }
}
