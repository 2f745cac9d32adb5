// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Primary heartbeats and per-peer reachability.
//!
//! The primary sends a [`HeartbeatMessage`] to every peer each heartbeat
//! interval. Replicas record who sent it and when, which is how they learn
//! the primary's address without polling the shared markers. On the sending
//! side the tracker keeps the outcome of the last round per peer for the
//! status endpoint.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_core::{unix_millis, PeerConfig};
use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::message::{ClusterMessage, ClusterResponse, HeartbeatMessage, HeartbeatResponse};
use crate::transport::{fan_out, ClusterTransport};

/// Consecutive failed heartbeats after which a peer is reported unreachable.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Reachability of a peer as seen by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// No heartbeat has been sent yet.
    Unknown,
    /// The last heartbeat was answered.
    Healthy,
    /// At least one recent heartbeat failed.
    Degraded,
    /// The failure threshold was reached.
    Unreachable,
}

/// Heartbeat bookkeeping for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHealth {
    /// Peer node ID.
    pub id: String,
    /// Peer address.
    pub address: String,
    /// Current state.
    pub state: PeerState,
    /// Time of the last answered heartbeat (unix milliseconds).
    pub last_success: Option<i64>,
    /// Failures since the last answered heartbeat.
    pub consecutive_failures: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

/// The primary as last heard from by a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryContact {
    /// Node ID of the primary.
    pub id: String,
    /// Address of the primary.
    pub address: String,
    /// When the heartbeat arrived (unix milliseconds).
    pub received_at: i64,
}

/// Tracks heartbeats in both directions.
pub struct HeartbeatTracker {
    peers: DashMap<String, PeerHealth>,
    failure_threshold: u32,
    primary: RwLock<Option<PrimaryContact>>,
    last_round: AtomicI64,
}

impl HeartbeatTracker {
    /// Creates a tracker for `peers`, all initially [`PeerState::Unknown`].
    pub fn new(peers: &[PeerConfig]) -> Self {
        Self::with_threshold(peers, DEFAULT_FAILURE_THRESHOLD)
    }

    /// Creates a tracker with a custom failure threshold.
    pub fn with_threshold(peers: &[PeerConfig], failure_threshold: u32) -> Self {
        let tracked = DashMap::new();
        for peer in peers {
            tracked.insert(
                peer.id.clone(),
                PeerHealth {
                    id: peer.id.clone(),
                    address: peer.address.clone(),
                    state: PeerState::Unknown,
                    last_success: None,
                    consecutive_failures: 0,
                    last_error: None,
                },
            );
        }
        Self {
            peers: tracked,
            failure_threshold: failure_threshold.max(1),
            primary: RwLock::new(None),
            last_round: AtomicI64::new(0),
        }
    }

    /// Sends one heartbeat round from the primary at `address`.
    ///
    /// Returns the number of peers that answered.
    pub async fn send_heartbeats(
        &self,
        transport: &Arc<dyn ClusterTransport>,
        peers: &[PeerConfig],
        id: &str,
        address: &str,
        request_timeout: Duration,
    ) -> usize {
        if peers.is_empty() {
            return 0;
        }

        let message = ClusterMessage::Heartbeat(HeartbeatMessage {
            address: address.to_string(),
            id: id.to_string(),
            time: unix_millis(),
        });

        let start = Instant::now();
        let results = fan_out(
            transport,
            peers,
            message,
            request_timeout,
            tokio::time::Instant::now() + request_timeout,
        )
        .await;
        histogram!("basalt_heartbeat_round_duration_seconds").record(start.elapsed().as_secs_f64());

        let mut answered = 0;
        for (peer, result) in results {
            match result {
                Ok(ClusterResponse::Heartbeat(_)) => {
                    answered += 1;
                    counter!("basalt_heartbeats_sent_total", "to" => peer.id.clone()).increment(1);
                    self.record_success(&peer);
                }
                Ok(other) => {
                    self.record_failure(&peer, format!("unexpected reply {other:?}"));
                }
                Err(e) => self.record_failure(&peer, e.to_string()),
            }
        }
        self.last_round.store(unix_millis(), Ordering::Relaxed);
        trace!(answered, peers = peers.len(), "Heartbeat round complete");
        answered
    }

    /// Records a heartbeat received from the primary and builds the reply.
    pub fn on_heartbeat(&self, heartbeat: &HeartbeatMessage) -> HeartbeatResponse {
        let received_at = unix_millis();
        let mut primary = self.primary.write();
        let changed = primary.as_ref().map_or(true, |p| p.address != heartbeat.address);
        if changed {
            info!(primary = %heartbeat.id, address = %heartbeat.address, "Following new primary");
        }
        *primary = Some(PrimaryContact {
            id: heartbeat.id.clone(),
            address: heartbeat.address.clone(),
            received_at,
        });
        counter!("basalt_heartbeats_received_total").increment(1);
        HeartbeatResponse { time: received_at }
    }

    /// The primary this node last heard from.
    pub fn primary_contact(&self) -> Option<PrimaryContact> {
        self.primary.read().clone()
    }

    /// Forgets the last primary contact.
    pub fn clear_primary_contact(&self) {
        *self.primary.write() = None;
    }

    /// Time of the last completed send round (unix milliseconds), zero if none.
    pub fn last_round(&self) -> i64 {
        self.last_round.load(Ordering::Relaxed)
    }

    /// Current state of a peer.
    pub fn peer_state(&self, id: &str) -> Option<PeerState> {
        self.peers.get(id).map(|p| p.state)
    }

    /// All tracked peers, ordered by ID.
    pub fn snapshot(&self) -> Vec<PeerHealth> {
        let mut peers: Vec<PeerHealth> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    fn record_success(&self, peer: &PeerConfig) {
        let mut entry = self.entry(peer);
        if entry.state == PeerState::Unreachable {
            info!(peer = %peer.id, "Peer reachable again");
        }
        entry.state = PeerState::Healthy;
        entry.last_success = Some(unix_millis());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    fn record_failure(&self, peer: &PeerConfig, error: String) {
        counter!("basalt_heartbeat_send_errors_total", "to" => peer.id.clone()).increment(1);
        let mut entry = self.entry(peer);
        entry.consecutive_failures += 1;
        let state = if entry.consecutive_failures >= self.failure_threshold {
            PeerState::Unreachable
        } else {
            PeerState::Degraded
        };
        if state == PeerState::Unreachable && entry.state != PeerState::Unreachable {
            warn!(peer = %peer.id, error = %error, "Peer unreachable");
        } else {
            debug!(peer = %peer.id, error = %error, "Heartbeat failed");
        }
        entry.state = state;
        entry.last_error = Some(error);
    }

    fn entry(&self, peer: &PeerConfig) -> dashmap::mapref::one::RefMut<'_, String, PeerHealth> {
        self.peers.entry(peer.id.clone()).or_insert_with(|| PeerHealth {
            id: peer.id.clone(),
            address: peer.address.clone(),
            state: PeerState::Unknown,
            last_success: None,
            consecutive_failures: 0,
            last_error: None,
        })
    }
}
