// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Seams between the cluster layer and the storage layer.
//!
//! Storage needs to know the local node's role (only the primary may write,
//! checkpoint or collect garbage) and, for garbage collection, which WAL
//! versions replicas still read. The cluster layer needs to answer WAL usage
//! requests from the primary. These traits keep the two crates independent.

use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;

use crate::types::{BranchKey, Membership};

/// Read access to the local node's current role.
pub trait NodeRole: Send + Sync {
    /// Returns the node's current membership.
    fn membership(&self) -> Membership;

    /// Returns true if the node is the primary.
    fn is_primary(&self) -> bool {
        self.membership() == Membership::Primary
    }

    /// Returns true if the node is a replica.
    fn is_replica(&self) -> bool {
        self.membership() == Membership::Replica
    }
}

/// A role that only changes when told to.
///
/// Used for single-node deployments and tests.
#[derive(Debug)]
pub struct FixedRole {
    membership: AtomicU8,
}

impl FixedRole {
    /// Creates a role fixed to `membership`.
    #[must_use]
    pub fn new(membership: Membership) -> Self {
        Self { membership: AtomicU8::new(encode(membership)) }
    }

    /// Creates a primary role.
    #[must_use]
    pub fn primary() -> Self {
        Self::new(Membership::Primary)
    }

    /// Creates a replica role.
    #[must_use]
    pub fn replica() -> Self {
        Self::new(Membership::Replica)
    }

    /// Changes the role.
    pub fn set(&self, membership: Membership) {
        self.membership.store(encode(membership), Ordering::SeqCst);
    }
}

impl NodeRole for FixedRole {
    fn membership(&self) -> Membership {
        decode(self.membership.load(Ordering::SeqCst))
    }
}

const fn encode(membership: Membership) -> u8 {
    match membership {
        Membership::Idle => 0,
        Membership::Primary => 1,
        Membership::Replica => 2,
    }
}

const fn decode(raw: u8) -> Membership {
    match raw {
        1 => Membership::Primary,
        2 => Membership::Replica,
        _ => Membership::Idle,
    }
}

/// Answers "which WAL versions does this node still read?" for a branch.
///
/// Implemented by the storage layer; queried by the cluster layer when the
/// primary surveys replicas before garbage collection.
pub trait WalUsageProvider: Send + Sync {
    /// Returns the WAL versions with a positive reference count on this node.
    fn wal_versions_in_use(&self, branch: &BranchKey) -> Vec<i64>;
}

/// Result of surveying every replica for its WAL usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaWalUsage {
    /// Oldest version any responding replica still reads, if any reported one.
    pub oldest_version: Option<i64>,
    /// Number of replicas that answered before the deadline.
    pub responded: usize,
    /// Number of replicas that were asked.
    pub surveyed: usize,
}

impl ReplicaWalUsage {
    /// Returns true if every surveyed replica answered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.responded == self.surveyed
    }
}

/// Asks replicas which WAL versions they still depend on.
///
/// Implemented by the cluster layer; used by the WAL manager's garbage
/// collection.
#[async_trait]
pub trait ReplicaWalSurvey: Send + Sync {
    /// Surveys all replicas for the given branch.
    async fn survey(&self, branch: &BranchKey) -> ReplicaWalUsage;
}

/// A survey for clusters without replicas.
pub struct NoReplicas;

#[async_trait]
impl ReplicaWalSurvey for NoReplicas {
    async fn survey(&self, _branch: &BranchKey) -> ReplicaWalUsage {
        ReplicaWalUsage::default()
    }
}
