//! Error types for cluster operations.

use crate::PeerId;

/// Errors that can occur during cluster operations.
///
/// Nothing here is fatal to the process. Membership churn is a normal
/// operating condition, so most of these surface to a caller as "try again
/// later" rather than as a crash.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The bucket has no owner assigned and the request must go remote.
    #[error("bucket {0} has no owner")]
    NoOwner(u16),

    /// The key does not route to a bucket owned by this process.
    #[error("key '{key}' is not owned by this server")]
    NotLocal { key: String },

    /// The bucket is in the middle of an ownership handoff.
    #[error("bucket {0} is changing owners")]
    BucketInTransition(u16),

    /// Peer not present in the membership table.
    #[error("peer {0} is not known")]
    UnknownPeer(PeerId),

    /// Network error while talking to a peer.
    #[error("peer communication error: {0}")]
    Network(String),

    /// Timeout waiting for a peer.
    #[error("peer request timed out")]
    Timeout,

    /// Malformed or unexpected payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer handled the request and reported a failure.
    #[error("peer rejected request: {0}")]
    Remote(String),

    /// Inbound request for a path this node does not serve.
    #[error("unknown path '{0}'")]
    UnknownPath(String),

    /// A key or name too long to put on the wire.
    #[error("{0} byte string exceeds the 65535 byte wire limit")]
    TooLong(usize),

    /// A forwarded request ran out of hops.
    #[error("forwarding ttl exhausted")]
    TtlExpired,

    /// The node has been shut down.
    #[error("node is shutting down")]
    Shutdown,

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}

impl ClusterError {
    /// Returns true if the failure is expected to clear up by itself,
    /// e.g. while buckets are being rebalanced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::NoOwner(_)
                | ClusterError::BucketInTransition(_)
                | ClusterError::Network(_)
                | ClusterError::Timeout
        )
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof => {
                ClusterError::Protocol(e.to_string())
            }
            std::io::ErrorKind::TimedOut => ClusterError::Timeout,
            _ => ClusterError::Network(e.to_string()),
        }
    }
}
