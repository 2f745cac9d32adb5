// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster wire messages.

use serde::{Deserialize, Serialize};

/// Sent by the primary to every peer each heartbeat interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Address of the primary.
    pub address: String,
    /// Node ID of the primary.
    pub id: String,
    /// Send time (unix milliseconds).
    pub time: i64,
}

/// Reply to a [`HeartbeatMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Receive time (unix milliseconds).
    pub time: i64,
}

/// Asks a peer to vote for a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Node ID of the candidate.
    pub candidate: String,
    /// Random seed identifying the election attempt.
    pub seed: u64,
    /// Election start time (unix milliseconds).
    pub started_at: i64,
    /// Election end time (unix milliseconds).
    pub ends_at: i64,
}

/// Reply to a [`VoteRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Whether the vote was granted.
    pub granted: bool,
}

/// Asks a replica which WAL versions of a branch it still reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalVersionUsageRequest {
    /// Database identifier.
    pub database_id: String,
    /// Branch identifier.
    pub branch_id: String,
}

/// Reply to a [`WalVersionUsageRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalVersionUsageResponse {
    /// Versions with a positive reference count on the replica.
    pub versions: Vec<i64>,
}

/// A message sent between cluster members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    /// Primary liveness announcement.
    Heartbeat(HeartbeatMessage),
    /// Election vote request.
    Vote(VoteRequest),
    /// WAL usage survey before garbage collection.
    WalVersionUsage(WalVersionUsageRequest),
}

impl ClusterMessage {
    /// Short name used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "heartbeat",
            Self::Vote(_) => "vote",
            Self::WalVersionUsage(_) => "wal_version_usage",
        }
    }
}

/// A reply to a [`ClusterMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterResponse {
    /// Reply to a heartbeat.
    Heartbeat(HeartbeatResponse),
    /// Reply to a vote request.
    Vote(VoteResponse),
    /// Reply to a WAL usage request.
    WalVersionUsage(WalVersionUsageResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_tagged() {
        let message = ClusterMessage::Vote(VoteRequest {
            candidate: "node-1".into(),
            seed: 7,
            started_at: 1_000,
            ends_at: 4_000,
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "vote");
        assert_eq!(json["candidate"], "node-1");

        let parsed: ClusterMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.kind(), "vote");
    }

    #[test]
    fn test_usage_response_shape() {
        let raw = r#"{"type":"wal_version_usage","versions":[3,5]}"#;
        let response: ClusterResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            response,
            ClusterResponse::WalVersionUsage(WalVersionUsageResponse { versions: vec![3, 5] })
        );
    }
}
