// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Primary election.
//!
//! An election attempt runs in four steps:
//!
//! 1. Sleep a random jitter so concurrently started nodes do not collide
//!    (skipped in single-member clusters).
//! 2. Take the `PRIMARY` advisory lock without blocking. If another process
//!    holds it, this attempt is lost.
//! 3. While holding the lock, ask every peer for a vote. Votes from strictly
//!    more than half of all members (counting this node) are needed; a peer
//!    that does not answer in time counts as "no".
//! 4. On a majority, write this node's address to `PRIMARY` and the initial
//!    expiry to `LEASE` before the lock is released.

use std::sync::Arc;

use basalt_core::{unix_millis, unix_secs, ClusterConfig};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::lease::{live_primary, Lease};
use crate::lock::{DistributedLock, LEASE, PRIMARY};
use crate::message::{ClusterMessage, ClusterResponse, VoteRequest, VoteResponse};
use crate::transport::{fan_out, ClusterTransport};

/// One election attempt by the local node.
pub struct Election {
    candidate: String,
    address: String,
    seed: u64,
    config: ClusterConfig,
    lock: Arc<dyn DistributedLock>,
    transport: Arc<dyn ClusterTransport>,
}

impl Election {
    /// Prepares an attempt for the node `candidate` reachable at `address`.
    pub fn new(
        candidate: impl Into<String>,
        address: impl Into<String>,
        config: ClusterConfig,
        lock: Arc<dyn DistributedLock>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            candidate: candidate.into(),
            address: address.into(),
            seed: rand::random(),
            config,
            lock,
            transport,
        }
    }

    /// Random seed identifying this attempt.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs the attempt, returning the new lease if this node won.
    ///
    /// Losing is not an error. Only lock and marker I/O failures are.
    pub async fn run(self) -> Result<Option<Lease>> {
        if self.config.member_count() > 1 {
            tokio::time::sleep(self.jitter()).await;
        }

        let Some(mut primary) = self.lock.try_lock(PRIMARY)? else {
            debug!(candidate = %self.candidate, "PRIMARY is locked, election lost");
            return Ok(None);
        };

        if let Some(current) = live_primary(self.lock.as_ref())? {
            if current != self.address {
                debug!(candidate = %self.candidate, primary = %current, "Live primary exists");
                return Ok(None);
            }
        }

        let votes = self.collect_votes().await;
        let members = self.config.member_count();
        if (votes + 1) * 2 <= members {
            info!(
                candidate = %self.candidate,
                votes = votes + 1,
                members,
                "Election lost, no majority"
            );
            return Ok(None);
        }

        primary.write(self.address.as_bytes())?;
        let mut lease = self.lock.try_lock(LEASE)?.ok_or(ClusterError::LockHeld(LEASE))?;
        let expires_at = unix_secs() + self.config.lease_duration().as_secs() as i64;
        lease.write(expires_at.to_string().as_bytes())?;

        info!(
            candidate = %self.candidate,
            address = %self.address,
            votes = votes + 1,
            members,
            expires_at,
            "Election won"
        );
        Ok(Some(Lease::new(
            self.address,
            self.lock,
            self.config.lease_duration(),
            self.config.renew_low_water(),
            expires_at,
        )))
    }

    fn jitter(&self) -> std::time::Duration {
        let min = self.config.election_jitter_min_ms;
        let max = self.config.election_jitter_max_ms.max(min);
        std::time::Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Asks every peer for a vote and returns the number granted.
    async fn collect_votes(&self) -> usize {
        if self.config.peers.is_empty() {
            return 0;
        }

        let started_at = unix_millis();
        let window = self.config.election_timeout();
        let request = VoteRequest {
            candidate: self.candidate.clone(),
            seed: self.seed,
            started_at,
            ends_at: started_at + window.as_millis() as i64,
        };

        let results = fan_out(
            &self.transport,
            &self.config.peers,
            ClusterMessage::Vote(request),
            self.config.vote_request_timeout(),
            Instant::now() + window,
        )
        .await;

        let mut granted = 0;
        for (peer, result) in results {
            match result {
                Ok(ClusterResponse::Vote(VoteResponse { granted: true })) => {
                    granted += 1;
                    debug!(peer = %peer.id, "Vote granted");
                }
                Ok(ClusterResponse::Vote(VoteResponse { granted: false })) => {
                    debug!(peer = %peer.id, "Vote refused");
                }
                Ok(other) => {
                    warn!(peer = %peer.id, response = ?other, "Unexpected reply to vote request");
                }
                Err(e) => {
                    debug!(peer = %peer.id, error = %e, "Vote request failed");
                }
            }
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use basalt_core::PeerConfig;
    use tempfile::TempDir;

    use super::*;
    use crate::lock::{parse_lease, parse_primary, FileLock};
    use crate::transport::{LocalTransport, MessageHandler};

    struct Voter(bool);

    #[async_trait]
    impl MessageHandler for Voter {
        async fn handle_message(&self, _message: ClusterMessage) -> ClusterResponse {
            ClusterResponse::Vote(VoteResponse { granted: self.0 })
        }
    }

    fn config(peers: &[&str]) -> ClusterConfig {
        ClusterConfig {
            peers: peers
                .iter()
                .map(|a| PeerConfig { id: format!("node-{a}"), address: (*a).to_string() })
                .collect(),
            election_jitter_min_ms: 1,
            election_jitter_max_ms: 5,
            election_timeout_ms: 500,
            vote_request_timeout_ms: 500,
            ..ClusterConfig::default()
        }
    }

    fn election(
        dir: &TempDir,
        config: ClusterConfig,
        transport: Arc<LocalTransport>,
    ) -> (Election, Arc<dyn DistributedLock>) {
        let lock: Arc<dyn DistributedLock> = Arc::new(FileLock::new(dir.path()).unwrap());
        let election = Election::new("node-a", "a", config, Arc::clone(&lock), transport);
        (election, lock)
    }

    #[tokio::test]
    async fn test_single_member_always_wins() {
        let dir = TempDir::new().unwrap();
        let (election, lock) = election(&dir, config(&[]), Arc::new(LocalTransport::new()));

        let lease = election.run().await.unwrap().expect("single member wins");
        assert!(!lease.is_expired());
        assert_eq!(parse_primary(&lock.read(PRIMARY).unwrap()).as_deref(), Some("a"));
        assert_eq!(parse_lease(&lock.read(LEASE).unwrap()).unwrap(), Some(lease.expires_at()));
    }

    #[tokio::test]
    async fn test_majority_of_three() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let yes: Arc<dyn MessageHandler> = Arc::new(Voter(true));
        let no: Arc<dyn MessageHandler> = Arc::new(Voter(false));
        transport.register("b", &yes);
        transport.register("c", &no);

        let (election, _lock) = election(&dir, config(&["b", "c"]), transport);
        assert!(election.run().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_peers_count_as_no() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let yes: Arc<dyn MessageHandler> = Arc::new(Voter(true));
        transport.register("b", &yes);

        // Two of four members: not strictly more than half.
        let (election, lock) = election(&dir, config(&["b", "c", "d"]), transport);
        assert!(election.run().await.unwrap().is_none());
        assert!(lock.read(PRIMARY).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_primary_loses_immediately() {
        let dir = TempDir::new().unwrap();
        let (election, lock) = election(&dir, config(&[]), Arc::new(LocalTransport::new()));

        let other = FileLock::new(dir.path()).unwrap();
        let _held = other.try_lock(PRIMARY).unwrap().unwrap();
        assert!(election.run().await.unwrap().is_none());
        assert!(lock.read(LEASE).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_primary_blocks_election() {
        let dir = TempDir::new().unwrap();
        let (election, lock) = election(&dir, config(&[]), Arc::new(LocalTransport::new()));
        lock.try_lock(PRIMARY).unwrap().unwrap().write(b"z").unwrap();
        lock.try_lock(LEASE)
            .unwrap()
            .unwrap()
            .write((unix_secs() + 30).to_string().as_bytes())
            .unwrap();

        assert!(election.run().await.unwrap().is_none());
        assert_eq!(parse_primary(&lock.read(PRIMARY).unwrap()).as_deref(), Some("z"));
    }

    #[tokio::test]
    async fn test_stale_primary_is_replaced() {
        let dir = TempDir::new().unwrap();
        let (election, lock) = election(&dir, config(&[]), Arc::new(LocalTransport::new()));
        lock.try_lock(PRIMARY).unwrap().unwrap().write(b"z").unwrap();
        lock.try_lock(LEASE)
            .unwrap()
            .unwrap()
            .write((unix_secs() - 1).to_string().as_bytes())
            .unwrap();

        assert!(election.run().await.unwrap().is_some());
        assert_eq!(parse_primary(&lock.read(PRIMARY).unwrap()).as_deref(), Some("a"));
    }
}
