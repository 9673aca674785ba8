//! Coordination namespace layout
//!
//! The path names below are a contract with every deployed admin and
//! container process; changing them splits the cluster.
//!
//! ```text
//! /<namespace>
//! ├── admin                  leader election latches
//! ├── containers/<id>        ephemeral, one per live container
//! ├── streams/<name>         stream definitions
//! ├── jobs/<name>            job definitions
//! └── deployments
//!     ├── streams/<name>     stream deployment requests
//!     ├── jobs/<name>        job deployment requests
//!     └── modules/<id>/...   module deployments, keyed by container id
//! ```

use crate::error::{ClusterError, Result};

/// Default namespace for all cluster paths
pub const DEFAULT_NAMESPACE: &str = "xd";

pub const ADMIN: &str = "admin";
pub const CONTAINERS: &str = "containers";
pub const STREAMS: &str = "streams";
pub const JOBS: &str = "jobs";
pub const DEPLOYMENTS: &str = "deployments";
pub const MODULES: &str = "modules";

/// Path builder rooted at a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    namespace: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Paths {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Build an absolute path from segments under the namespace
    pub fn build(&self, segments: &[&str]) -> String {
        let mut path = String::with_capacity(
            1 + self.namespace.len() + segments.iter().map(|s| s.len() + 1).sum::<usize>(),
        );
        path.push('/');
        path.push_str(&self.namespace);
        for segment in segments {
            path.push('/');
            path.push_str(segment.trim_matches('/'));
        }
        path
    }

    pub fn containers(&self) -> String {
        self.build(&[CONTAINERS])
    }

    pub fn container(&self, id: &str) -> String {
        self.build(&[CONTAINERS, id])
    }

    pub fn streams(&self) -> String {
        self.build(&[STREAMS])
    }

    pub fn jobs(&self) -> String {
        self.build(&[JOBS])
    }

    pub fn stream_deployments(&self) -> String {
        self.build(&[DEPLOYMENTS, STREAMS])
    }

    pub fn job_deployments(&self) -> String {
        self.build(&[DEPLOYMENTS, JOBS])
    }

    pub fn module_deployments(&self) -> String {
        self.build(&[DEPLOYMENTS, MODULES])
    }

    /// Module deployments assigned to one container
    pub fn container_deployments(&self, container_id: &str) -> String {
        self.build(&[DEPLOYMENTS, MODULES, container_id])
    }

    /// Election path shared by every admin process
    pub fn election(&self) -> String {
        self.build(&[ADMIN])
    }

    /// Paths that must exist before an admin contends for leadership
    pub fn required(&self) -> Vec<String> {
        vec![
            self.module_deployments(),
            self.stream_deployments(),
            self.job_deployments(),
            self.containers(),
            self.streams(),
            self.jobs(),
        ]
    }
}

/// Last segment of a path (`/xd/containers/c1` -> `c1`)
pub fn strip_path(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of an absolute path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Validate an absolute, normalized path
pub fn validate(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//")
        && !path.split('/').any(|s| s == "." || s == "..");
    if valid {
        Ok(())
    } else {
        Err(ClusterError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_paths() {
        let paths = Paths::default();
        assert_eq!(paths.containers(), "/xd/containers");
        assert_eq!(paths.module_deployments(), "/xd/deployments/modules");
        assert_eq!(paths.container_deployments("c1"), "/xd/deployments/modules/c1");
        assert_eq!(paths.election(), "/xd/admin");
        assert_eq!(paths.build(&["/streams/", "ticktock"]), "/xd/streams/ticktock");
    }

    #[test]
    fn test_custom_namespace() {
        let paths = Paths::new("staging");
        assert_eq!(paths.stream_deployments(), "/staging/deployments/streams");
        assert_eq!(paths.required().len(), 6);
    }

    #[test]
    fn test_strip_and_parent() {
        assert_eq!(strip_path("/xd/containers/c1"), "c1");
        assert_eq!(strip_path("c1"), "c1");
        assert_eq!(parent("/xd/containers/c1"), Some("/xd/containers"));
        assert_eq!(parent("/xd"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(join("/", "xd"), "/xd");
        assert_eq!(join("/xd", "admin"), "/xd/admin");
    }

    #[test]
    fn test_validate() {
        assert!(validate("/").is_ok());
        assert!(validate("/xd/containers").is_ok());
        assert!(validate("xd").is_err());
        assert!(validate("/xd/").is_err());
        assert!(validate("/xd//a").is_err());
        assert!(validate("/xd/../a").is_err());
    }
}
