//! Cluster error types

use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ==================== Coordination Errors ====================
    #[error("no node at path: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("connection to coordination service lost")]
    ConnectionLoss,

    #[error("coordination session expired")]
    SessionExpired,

    #[error("coordination client closed")]
    Closed,

    // ==================== Leadership Errors ====================
    #[error("leadership request failed: {0}")]
    LeadershipRequest(#[source] Box<ClusterError>),

    #[error("election error: {0}")]
    Election(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    // ==================== Data Errors ====================
    #[error("corrupt data: {0}")]
    CorruptData(String),

    // ==================== Internal Errors ====================
    #[error("internal error: {0}")]
    Internal(String),

    #[error("shutdown in progress")]
    ShuttingDown,
}

impl ClusterError {
    /// Check if the error reports a missing node
    pub fn is_no_node(&self) -> bool {
        matches!(self, ClusterError::NoNode(_))
    }

    /// Check if the error is caused by the client's connection state
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClusterError::ConnectionLoss | ClusterError::SessionExpired | ClusterError::Closed
        )
    }

    /// Check if this error is retriable
    ///
    /// Connection loss recovers on reconnect; an expired session is replaced
    /// by a fresh one. A closed client never comes back.
    pub fn is_retriable(&self) -> bool {
        match self {
            ClusterError::ConnectionLoss
            | ClusterError::SessionExpired
            | ClusterError::NodeExists(_)
            | ClusterError::Election(_) => true,
            ClusterError::LeadershipRequest(inner) => inner.is_retriable(),
            _ => false,
        }
    }

    /// Wrap an error as a failed leadership request
    pub(crate) fn leadership_request(err: ClusterError) -> Self {
        match err {
            e @ ClusterError::LeadershipRequest(_) => e,
            e => ClusterError::LeadershipRequest(Box::new(e)),
        }
    }
}

impl From<tokio::task::JoinError> for ClusterError {
    fn from(e: tokio::task::JoinError) -> Self {
        ClusterError::Internal(format!("task failed: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for ClusterError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        ClusterError::CorruptData(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(ClusterError::ConnectionLoss.is_retriable());
        assert!(ClusterError::SessionExpired.is_retriable());
        assert!(!ClusterError::Closed.is_retriable());
        assert!(!ClusterError::CorruptData("bad".into()).is_retriable());
    }

    #[test]
    fn test_leadership_request_wraps_once() {
        let err = ClusterError::leadership_request(ClusterError::ConnectionLoss);
        assert!(err.is_retriable());

        let rewrapped = ClusterError::leadership_request(err);
        match rewrapped {
            ClusterError::LeadershipRequest(inner) => {
                assert!(matches!(*inner, ClusterError::ConnectionLoss))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_task_is_internal() {
        let join = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        assert!(matches!(ClusterError::from(join), ClusterError::Internal(_)));
    }

    #[test]
    fn test_classification() {
        assert!(ClusterError::NoNode("/xd".into()).is_no_node());
        assert!(!ClusterError::NodeExists("/xd".into()).is_no_node());
        assert!(ClusterError::Closed.is_connection_error());
        assert!(!ClusterError::ShuttingDown.is_connection_error());
    }
}
