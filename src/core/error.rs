//! Error types and failure classification.
//!
//! Only [`CacheError::TopologyStale`] is recovered inside the invocation
//! pipeline (by a full restart with a fresh context). Every other failure
//! propagates to the caller unchanged so infrastructure failures stay
//! distinguishable from domain failures.

use crate::core::lifecycle::ComponentStatus;
use thiserror::Error;

/// Common Tessera error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The topology observed by the invocation no longer matches the cluster.
    #[error("topology_stale: expected {expected_topology}, observed {observed_topology}")]
    TopologyStale {
        expected_topology: u64,
        observed_topology: u64,
    },

    /// A key lock could not be acquired within the configured bound.
    #[error("lock timeout after {timeout_ms}ms on key {key}")]
    LockTimeout { key: String, timeout_ms: u64 },

    /// A remote node could not be reached.
    #[error("transport failure talking to {node}: {message}")]
    Transport { node: String, message: String },

    /// A transaction's read value changed before it could commit.
    #[error("write skew detected on key {key}")]
    WriteSkew { key: String },

    /// The operation is meaningless for this command kind.
    #[error("unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// The command is malformed or not valid in this context.
    #[error("invalid command: {message}")]
    InvalidCommand { message: String },

    /// The invocation was cancelled at a suspension point.
    #[error("invocation cancelled")]
    Cancelled,

    /// The cache is not accepting invocations.
    #[error("cache not running: {status}")]
    NotRunning { status: ComponentStatus },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CacheError {
    /// Create a TopologyStale error.
    pub fn topology_stale(expected: u64, observed: u64) -> Self {
        Self::TopologyStale {
            expected_topology: expected,
            observed_topology: observed,
        }
    }

    /// Create a LockTimeout error.
    pub fn lock_timeout(key: &[u8], timeout_ms: u64) -> Self {
        Self::LockTimeout {
            key: display_key(key),
            timeout_ms,
        }
    }

    /// Create a Transport error.
    pub fn transport(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Create a WriteSkew error.
    pub fn write_skew(key: &[u8]) -> Self {
        Self::WriteSkew {
            key: display_key(key),
        }
    }

    /// Create an Unsupported error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create an InvalidCommand error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the caller may retry the whole operation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::TopologyStale { .. }
                | Self::LockTimeout { .. }
                | Self::Transport { .. }
                | Self::WriteSkew { .. }
        )
    }

    /// Check if the invoker restarts the invocation on this error.
    pub fn is_topology_stale(&self) -> bool {
        matches!(self, Self::TopologyStale { .. })
    }

    /// Check if this error comes from cluster infrastructure rather than
    /// the command itself.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::TopologyStale { .. }
                | Self::LockTimeout { .. }
                | Self::Transport { .. }
                | Self::Cancelled
                | Self::NotRunning { .. }
        )
    }
}

/// Result type using CacheError.
pub type CacheResult<T> = Result<T, CacheError>;

/// Render a key for error messages and log fields.
pub fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => s.to_string(),
        Err(_) => format!("0x{}", key.iter().map(|b| format!("{:02x}", b)).collect::<String>()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(CacheError::topology_stale(1, 2).is_retriable());
        assert!(CacheError::lock_timeout(b"k", 10).is_retriable());
        assert!(!CacheError::unsupported("load_type").is_retriable());
        assert!(!CacheError::Cancelled.is_retriable());
    }

    #[test]
    fn test_only_topology_stale_restarts() {
        assert!(CacheError::topology_stale(3, 4).is_topology_stale());
        assert!(!CacheError::lock_timeout(b"k", 10).is_topology_stale());
    }

    #[test]
    fn test_display_key_binary() {
        assert_eq!(display_key(b"user:1"), "user:1");
        assert_eq!(display_key(&[0xff, 0x00]), "0xff00");
    }

    #[test]
    fn test_error_messages() {
        let err = CacheError::topology_stale(5, 7);
        assert_eq!(err.to_string(), "topology_stale: expected 5, observed 7");
        let err = CacheError::lock_timeout(b"k1", 250);
        assert_eq!(err.to_string(), "lock timeout after 250ms on key k1");
    }
}
