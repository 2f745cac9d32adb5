// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Common types used throughout Basalt.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifies one branch of one database.
///
/// Every WAL manager, checkpointer and page store is scoped to exactly one
/// `BranchKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchKey {
    /// Database identifier.
    pub database_id: String,
    /// Branch identifier within the database.
    pub branch_id: String,
}

impl BranchKey {
    /// Creates a new branch key.
    #[must_use]
    pub fn new(database_id: impl Into<String>, branch_id: impl Into<String>) -> Self {
        Self { database_id: database_id.into(), branch_id: branch_id.into() }
    }

    /// Directory of this branch, relative to the cluster file-system root.
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        PathBuf::from(&self.database_id).join(&self.branch_id)
    }

    /// Directory holding the branch's logs (`<branch-dir>/logs`).
    #[must_use]
    pub fn logs_directory(&self) -> PathBuf {
        self.directory().join("logs")
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database_id, self.branch_id)
    }
}

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// The node holds the lease and accepts writes.
    Primary,
    /// The node follows a primary and serves reads.
    Replica,
    /// The node has not joined leadership yet.
    #[default]
    Idle,
}

impl Membership {
    /// Returns the lowercase name of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
            Self::Idle => "idle",
        }
    }
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Current wall-clock time in whole seconds since the Unix epoch.
#[must_use]
pub fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_directories() {
        let key = BranchKey::new("db1", "main");
        assert_eq!(key.directory(), PathBuf::from("db1/main"));
        assert_eq!(key.logs_directory(), PathBuf::from("db1/main/logs"));
        assert_eq!(key.to_string(), "db1/main");
    }

    #[test]
    fn test_membership_display() {
        assert_eq!(Membership::Primary.to_string(), "primary");
        assert_eq!(Membership::Replica.as_str(), "replica");
        assert_eq!(Membership::default(), Membership::Idle);
    }

    #[test]
    fn test_clock_units_agree() {
        let secs = unix_secs();
        let nanos = unix_nanos();
        assert!((nanos / 1_000_000_000 - secs).abs() <= 1);
    }
}
