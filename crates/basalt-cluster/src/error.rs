// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for leadership operations.

use thiserror::Error;

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur in the cluster layer.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The lease expired before it could be renewed.
    #[error("lease expired")]
    LeaseExpired,

    /// The operation requires the primary role.
    #[error("node is not the primary")]
    NotPrimary,

    /// The durable primary marker names another node.
    #[error("primary marker names {found:?}, expected {expected:?}")]
    MarkerMismatch {
        /// This node's address.
        expected: String,
        /// What the marker contains.
        found: String,
    },

    /// A marker file is locked by another process.
    #[error("{0} marker is locked by another process")]
    LockHeld(&'static str),

    /// A marker file could not be parsed.
    #[error("invalid {what} marker: {reason}")]
    InvalidMarker {
        /// Which marker.
        what: &'static str,
        /// Why parsing failed.
        reason: String,
    },

    /// A message could not be delivered to a peer.
    #[error("transport error to {peer}: {reason}")]
    Transport {
        /// Address of the peer.
        peer: String,
        /// Why delivery failed.
        reason: String,
    },

    /// The peer answered with a response of the wrong kind.
    #[error("unexpected response from {0}")]
    UnexpectedResponse(String),

    /// The node is shutting down.
    #[error("node is shutting down")]
    Shutdown,

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Returns true for errors that mean another node holds the primary role.
    ///
    /// Nodes that see one of these demote themselves instead of retrying.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::MarkerMismatch { .. } | Self::InvalidMarker { .. })
    }

    /// Returns true for expected races retried on the next tick.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockHeld(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let mismatch =
            ClusterError::MarkerMismatch { expected: "a:1".into(), found: "b:1".into() };
        assert!(mismatch.is_integrity());
        assert!(!mismatch.is_contention());
        assert!(ClusterError::LockHeld("PRIMARY").is_contention());
        assert!(!ClusterError::LeaseExpired.is_integrity());
        assert_eq!(mismatch.to_string(), "primary marker names \"b:1\", expected \"a:1\"");
    }
}
