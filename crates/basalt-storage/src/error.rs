// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for WAL and checkpoint operations.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage layer.
///
/// Variants fall into the classes reported by [`StorageError::is_contention`]
/// and [`StorageError::is_role_violation`]; everything else is an integrity
/// or I/O failure that the caller must handle.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A node other than the primary tried to create a WAL version.
    #[error("cannot create a WAL version on a replica or idle node")]
    CreateWalVersionOnReplica,

    /// A node other than the primary tried to write to a WAL segment.
    #[error("cannot write WAL version {version} on a replica or idle node")]
    WriteOnReplica {
        /// The WAL version that was targeted.
        version: i64,
    },

    /// A node other than the primary tried to checkpoint.
    #[error("cannot checkpoint on a replica or idle node")]
    CheckpointOnReplica,

    /// A node other than the primary tried to run WAL garbage collection.
    #[error("cannot run WAL garbage collection on a replica or idle node")]
    GarbageCollectionOnReplica,

    /// The WAL manager is already checkpointing this branch.
    #[error("a WAL checkpoint is already running for {branch}")]
    CheckpointInProgress {
        /// Branch being checkpointed.
        branch: String,
    },

    /// The checkpointer already has an open checkpoint.
    #[error("checkpoint already in progress (timestamp {timestamp})")]
    CheckpointAlreadyInProgress {
        /// Timestamp of the open checkpoint.
        timestamp: i64,
    },

    /// The checkpointer has no open checkpoint.
    #[error("no checkpoint in progress")]
    NoCheckpointInProgress,

    /// The WAL version is no longer the current writable version.
    #[error("WAL version {version} has been superseded by {current}")]
    WalVersionSuperseded {
        /// The version the caller asked for.
        version: i64,
        /// The current writable version.
        current: i64,
    },

    /// The WAL version does not exist (never created or already collected).
    #[error("WAL version {0} not found")]
    WalVersionNotFound(i64),

    /// A caller touched a WAL segment after it was checkpointed.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// A persisted structure could not be decoded.
    #[error("corrupt {what}: {reason}")]
    Corrupt {
        /// What was being decoded.
        what: &'static str,
        /// Why decoding failed.
        reason: String,
    },

    /// Page number outside the valid range.
    #[error("invalid page number {0}")]
    InvalidPage(u64),

    /// One or more steps of a multi-part operation failed.
    #[error("{operation} failed: {}", join_errors(.errors))]
    Aggregate {
        /// The operation that was attempted.
        operation: &'static str,
        /// Every failure, in step order.
        errors: Vec<StorageError>,
    },

    /// A background task could not be joined.
    #[error("task failed: {0}")]
    Task(String),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Expected races that the caller retries on its next tick.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::CheckpointInProgress { .. } | Self::CheckpointAlreadyInProgress { .. }
        )
    }

    /// Operations requested on the wrong role; retrying will not help.
    #[must_use]
    pub fn is_role_violation(&self) -> bool {
        matches!(
            self,
            Self::CreateWalVersionOnReplica
                | Self::WriteOnReplica { .. }
                | Self::CheckpointOnReplica
                | Self::GarbageCollectionOnReplica
        )
    }
}

fn join_errors(errors: &[StorageError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
