// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! The local cluster member.
//!
//! A [`Node`] moves between three roles:
//!
//! ```text
//! Idle ──election──▶ Primary ──expiry / step-down / marker loss──▶ Replica
//!   │                   ▲                                            │
//!   └──heartbeat──▶ Replica ◀───────────────election─────────────────┘
//! ```
//!
//! A monitor loop drives the transitions. On the primary it renews the
//! lease and sends heartbeats; elsewhere it watches the shared markers and
//! starts an election whenever no live primary is named.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use basalt_core::{
    unix_millis, BranchKey, ClusterConfig, Config, Membership, NodeRole, ReplicaWalSurvey,
    ReplicaWalUsage, WalUsageProvider,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::election::Election;
use crate::error::{ClusterError, Result};
use crate::heartbeat::{HeartbeatTracker, PeerHealth};
use crate::lease::{live_primary, Lease, LeaseRenewal};
use crate::lock::{DistributedLock, FileLock};
use crate::message::{
    ClusterMessage, ClusterResponse, VoteRequest, VoteResponse, WalVersionUsageRequest,
    WalVersionUsageResponse,
};
use crate::metrics::{record_election, record_lease_renewal, record_membership, record_vote};
use crate::transport::{fan_out, ClusterTransport, MessageHandler};

/// Point-in-time view of a node, served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Node ID.
    pub id: String,
    /// Node address.
    pub address: String,
    /// Current role.
    pub membership: Membership,
    /// Address of the primary this node knows about.
    pub primary_address: Option<String>,
    /// Lease expiry (unix seconds) while primary.
    pub lease_expires_at: Option<i64>,
    /// Heartbeat state per peer (primary only).
    pub peers: Vec<PeerHealth>,
}

#[derive(Debug, Clone)]
struct CastVote {
    candidate: String,
    ends_at: i64,
}

/// A cluster member.
pub struct Node {
    id: String,
    address: String,
    config: ClusterConfig,
    membership: RwLock<Membership>,
    lease: Mutex<Option<Lease>>,
    primary_address: RwLock<Option<String>>,
    vote: Mutex<Option<CastVote>>,
    electing: AtomicBool,
    lock: Arc<dyn DistributedLock>,
    transport: Arc<dyn ClusterTransport>,
    heartbeats: HeartbeatTracker,
    wal_usage: RwLock<Option<Weak<dyn WalUsageProvider>>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Creates an idle node.
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        config: ClusterConfig,
        lock: Arc<dyn DistributedLock>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        let heartbeats = HeartbeatTracker::new(&config.peers);
        Self {
            id: id.into(),
            address: address.into(),
            config,
            membership: RwLock::new(Membership::Idle),
            lease: Mutex::new(None),
            primary_address: RwLock::new(None),
            vote: Mutex::new(None),
            electing: AtomicBool::new(false),
            lock,
            transport,
            heartbeats,
            wal_usage: RwLock::new(None),
            shutdown: watch::channel(false).0,
        }
    }

    /// Creates a node from configuration, with file locks under the
    /// cluster root directory.
    pub fn from_config(config: &Config, transport: Arc<dyn ClusterTransport>) -> Result<Self> {
        let lock = Arc::new(FileLock::new(&config.cluster.root_dir)?);
        Ok(Self::new(
            config.node.id.clone(),
            config.node.address.clone(),
            config.cluster.clone(),
            lock,
            transport,
        ))
    }

    /// Node ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address other members reach this node at.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address of the current primary, if known.
    pub fn primary_address(&self) -> Option<String> {
        self.primary_address.read().clone()
    }

    /// Lease expiry while primary.
    pub fn lease_expires_at(&self) -> Option<i64> {
        self.lease.lock().as_ref().map(Lease::expires_at)
    }

    /// Heartbeat bookkeeping.
    pub fn heartbeats(&self) -> &HeartbeatTracker {
        &self.heartbeats
    }

    /// Registers the storage layer that answers WAL usage requests.
    ///
    /// Only a weak reference is kept; the storage layer itself holds the
    /// node as its role.
    pub fn set_wal_usage_provider(&self, provider: &Arc<dyn WalUsageProvider>) {
        *self.wal_usage.write() = Some(Arc::downgrade(provider));
    }

    /// Current status snapshot.
    pub fn status(&self) -> NodeStatus {
        let membership = self.membership();
        NodeStatus {
            id: self.id.clone(),
            address: self.address.clone(),
            membership,
            primary_address: self.primary_address(),
            lease_expires_at: self.lease_expires_at(),
            peers: if membership == Membership::Primary {
                self.heartbeats.snapshot()
            } else {
                Vec::new()
            },
        }
    }

    /// Starts the monitor and heartbeat loops.
    ///
    /// They run until [`shutdown`](Self::shutdown) is called.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut monitor = interval(node.config.monitor_interval());
            monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut heartbeat = interval(node.config.heartbeat_interval());
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                node_id = %node.id,
                address = %node.address,
                members = node.config.member_count(),
                "Node started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = monitor.tick() => {
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            () = node.tick() => {}
                        }
                    }
                    _ = heartbeat.tick() => {
                        if node.is_primary() {
                            node.send_heartbeats().await;
                        }
                    }
                }
            }
            info!(node_id = %node.id, "Node monitor stopped");
        })
    }

    /// Stops the loops and releases the lease if this node is primary.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        if self.is_primary() {
            self.step_down()?;
        }
        Ok(())
    }

    /// Runs one monitor step.
    pub async fn tick(&self) {
        if self.is_primary() {
            self.tick_primary().await;
        } else {
            self.tick_follower().await;
        }
    }

    async fn tick_primary(&self) {
        let step = {
            let lease = self.lease.lock();
            match lease.as_ref() {
                None => Err(ClusterError::NotPrimary),
                Some(lease) if lease.is_expired() => Err(ClusterError::LeaseExpired),
                Some(lease) if lease.should_renew() => lease.prepare_renewal().map(Some),
                Some(_) => Ok(None),
            }
        };
        let outcome = match step {
            Ok(Some(renewal)) => self.renew_lease(renewal).await.map(|()| true),
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(renewed) => {
                if renewed {
                    record_lease_renewal("renewed");
                }
            }
            Err(e) if e.is_contention() => {
                record_lease_renewal("contended");
                debug!(node_id = %self.id, error = %e, "Lease renewal contended, retrying");
            }
            Err(e @ (ClusterError::LeaseExpired | ClusterError::NotPrimary)) => {
                warn!(node_id = %self.id, error = %e, "Lost primary lease");
                self.demote();
            }
            Err(e) if e.is_integrity() => {
                record_lease_renewal("lost");
                warn!(node_id = %self.id, error = %e, "Another node holds the primary role");
                self.demote();
            }
            Err(e) => {
                record_lease_renewal("failed");
                warn!(node_id = %self.id, error = %e, "Lease renewal failed");
            }
        }
    }

    /// Runs the renewal's marker I/O on the blocking pool, then records it.
    async fn renew_lease(&self, renewal: LeaseRenewal) -> Result<()> {
        let (expires_at, renewed_at) = tokio::task::spawn_blocking(move || renewal.run())
            .await
            .map_err(|e| ClusterError::Io(std::io::Error::other(e)))??;

        match self.lease.lock().as_mut() {
            Some(lease) => {
                lease.complete_renewal(expires_at, renewed_at);
                Ok(())
            }
            // Stepped down while the renewal was in flight.
            None => Err(ClusterError::NotPrimary),
        }
    }

    async fn tick_follower(&self) {
        match live_primary(self.lock.as_ref()) {
            Ok(Some(primary)) if primary != self.address => self.follow(primary),
            Ok(_) => {
                if let Err(e) = self.run_election().await {
                    warn!(node_id = %self.id, error = %e, "Election failed");
                }
            }
            Err(e) => warn!(node_id = %self.id, error = %e, "Failed to read cluster markers"),
        }
    }

    /// Runs one election attempt. Returns true if this node became primary.
    ///
    /// Returns false without running if an attempt is already in progress.
    pub async fn run_election(&self) -> Result<bool> {
        if *self.shutdown.borrow() {
            return Err(ClusterError::Shutdown);
        }
        if self.electing.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let _electing = ElectingGuard(&self.electing);

        let election = Election::new(
            self.id.clone(),
            self.address.clone(),
            self.config.clone(),
            Arc::clone(&self.lock),
            Arc::clone(&self.transport),
        );
        debug!(node_id = %self.id, seed = election.seed(), "Starting election");

        match election.run().await {
            Ok(Some(lease)) => {
                record_election("won");
                *self.lease.lock() = Some(lease);
                *self.primary_address.write() = Some(self.address.clone());
                self.heartbeats.clear_primary_contact();
                self.set_membership(Membership::Primary);
                Ok(true)
            }
            Ok(None) => {
                record_election("lost");
                Ok(false)
            }
            Err(e) => {
                record_election("failed");
                Err(e)
            }
        }
    }

    /// Releases the lease and becomes a replica.
    ///
    /// Fails with [`ClusterError::NotPrimary`] if this node holds no lease.
    /// The node demotes itself even if releasing the markers fails.
    pub fn step_down(&self) -> Result<()> {
        let Some(mut lease) = self.lease.lock().take() else {
            return Err(ClusterError::NotPrimary);
        };
        let result = lease.release();
        self.demote();
        if let Err(e) = &result {
            warn!(node_id = %self.id, error = %e, "Failed to release lease");
        }
        result
    }

    async fn send_heartbeats(&self) {
        self.heartbeats
            .send_heartbeats(
                &self.transport,
                &self.config.peers,
                &self.id,
                &self.address,
                self.config.request_timeout(),
            )
            .await;
    }

    fn follow(&self, primary: String) {
        {
            let mut current = self.primary_address.write();
            if current.as_deref() != Some(primary.as_str()) {
                info!(node_id = %self.id, primary = %primary, "Following primary");
                *current = Some(primary);
            }
        }
        if self.membership() != Membership::Replica {
            self.set_membership(Membership::Replica);
        }
    }

    fn demote(&self) {
        self.lease.lock().take();
        *self.primary_address.write() = None;
        self.set_membership(Membership::Replica);
    }

    fn set_membership(&self, membership: Membership) {
        let previous = std::mem::replace(&mut *self.membership.write(), membership);
        if previous != membership {
            info!(node_id = %self.id, from = %previous, to = %membership, "Membership changed");
            record_membership(membership);
        }
    }

    fn grant_vote(&self, request: &VoteRequest) -> bool {
        let granted = self.decide_vote(request);
        record_vote(granted);
        granted
    }

    fn decide_vote(&self, request: &VoteRequest) -> bool {
        if self.is_primary() && self.lease.lock().as_ref().is_some_and(|l| !l.is_expired()) {
            debug!(candidate = %request.candidate, "Refusing vote, this node holds the lease");
            return false;
        }

        let candidate_address = if request.candidate == self.id {
            Some(self.address.clone())
        } else {
            self.config
                .peers
                .iter()
                .find(|p| p.id == request.candidate)
                .map(|p| p.address.clone())
        };
        let Some(candidate_address) = candidate_address else {
            warn!(candidate = %request.candidate, "Refusing vote for unknown member");
            return false;
        };

        match live_primary(self.lock.as_ref()) {
            Ok(Some(primary)) if primary != candidate_address => {
                debug!(candidate = %request.candidate, primary = %primary, "Refusing vote, live primary exists");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Refusing vote, cluster markers unreadable");
                return false;
            }
        }

        let now = unix_millis();
        let mut vote = self.vote.lock();
        if let Some(cast) = vote.as_ref() {
            if cast.candidate != request.candidate && now <= cast.ends_at {
                debug!(
                    candidate = %request.candidate,
                    voted_for = %cast.candidate,
                    "Refusing vote, already voted in this window"
                );
                return false;
            }
        }
        *vote = Some(CastVote { candidate: request.candidate.clone(), ends_at: request.ends_at });
        debug!(candidate = %request.candidate, seed = request.seed, "Vote granted");
        true
    }

    fn wal_versions_in_use(&self, request: WalVersionUsageRequest) -> Vec<i64> {
        let provider = self.wal_usage.read().as_ref().and_then(Weak::upgrade);
        match provider {
            Some(provider) => provider
                .wal_versions_in_use(&BranchKey::new(request.database_id, request.branch_id)),
            None => Vec::new(),
        }
    }
}

struct ElectingGuard<'a>(&'a AtomicBool);

impl Drop for ElectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl NodeRole for Node {
    fn membership(&self) -> Membership {
        *self.membership.read()
    }
}

#[async_trait]
impl MessageHandler for Node {
    async fn handle_message(&self, message: ClusterMessage) -> ClusterResponse {
        match message {
            ClusterMessage::Heartbeat(heartbeat) => {
                if heartbeat.address != self.address {
                    if self.is_primary() {
                        match live_primary(self.lock.as_ref()) {
                            Ok(Some(primary)) if primary == heartbeat.address => {
                                warn!(
                                    node_id = %self.id,
                                    primary = %primary,
                                    "Heartbeat from the marked primary, stepping down"
                                );
                                self.demote();
                                self.follow(heartbeat.address.clone());
                            }
                            _ => {}
                        }
                    } else {
                        self.follow(heartbeat.address.clone());
                    }
                }
                ClusterResponse::Heartbeat(self.heartbeats.on_heartbeat(&heartbeat))
            }
            ClusterMessage::Vote(request) => {
                ClusterResponse::Vote(VoteResponse { granted: self.grant_vote(&request) })
            }
            ClusterMessage::WalVersionUsage(request) => {
                ClusterResponse::WalVersionUsage(WalVersionUsageResponse {
                    versions: self.wal_versions_in_use(request),
                })
            }
        }
    }
}

#[async_trait]
impl ReplicaWalSurvey for Node {
    async fn survey(&self, branch: &BranchKey) -> ReplicaWalUsage {
        let peers = &self.config.peers;
        let mut usage = ReplicaWalUsage { surveyed: peers.len(), ..ReplicaWalUsage::default() };
        if peers.is_empty() {
            return usage;
        }

        let request = ClusterMessage::WalVersionUsage(WalVersionUsageRequest {
            database_id: branch.database_id.clone(),
            branch_id: branch.branch_id.clone(),
        });
        let timeout = self.config.request_timeout();
        let results = fan_out(&self.transport, peers, request, timeout, Instant::now() + timeout).await;

        for (peer, result) in results {
            match result {
                Ok(ClusterResponse::WalVersionUsage(response)) => {
                    usage.responded += 1;
                    if let Some(&oldest) = response.versions.iter().min() {
                        usage.oldest_version =
                            Some(usage.oldest_version.map_or(oldest, |o| o.min(oldest)));
                    }
                }
                Ok(other) => {
                    warn!(peer = %peer.id, response = ?other, "Unexpected reply to WAL usage request");
                }
                Err(e) => debug!(peer = %peer.id, error = %e, "WAL usage request failed"),
            }
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use basalt_core::PeerConfig;
    use tempfile::TempDir;

    use super::*;
    use crate::lock::{LEASE, PRIMARY};
    use crate::message::HeartbeatMessage;
    use crate::transport::LocalTransport;

    struct Usage(Vec<i64>);

    impl WalUsageProvider for Usage {
        fn wal_versions_in_use(&self, _branch: &BranchKey) -> Vec<i64> {
            self.0.clone()
        }
    }

    fn cluster(peers: &[(&str, &str)]) -> ClusterConfig {
        ClusterConfig {
            peers: peers
                .iter()
                .map(|(id, address)| PeerConfig { id: (*id).into(), address: (*address).into() })
                .collect(),
            election_jitter_min_ms: 1,
            election_jitter_max_ms: 5,
            election_timeout_ms: 500,
            vote_request_timeout_ms: 500,
            request_timeout_ms: 500,
            ..ClusterConfig::default()
        }
    }

    fn node(dir: &TempDir, id: &str, address: &str, config: ClusterConfig) -> Node {
        let lock: Arc<dyn DistributedLock> = Arc::new(FileLock::new(dir.path()).unwrap());
        Node::new(id, address, config, lock, Arc::new(LocalTransport::new()))
    }

    fn vote(candidate: &str) -> VoteRequest {
        let now = unix_millis();
        VoteRequest { candidate: candidate.into(), seed: 1, started_at: now, ends_at: now + 3_000 }
    }

    #[tokio::test]
    async fn test_single_node_becomes_primary_and_steps_down() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir, "a", "a:1", cluster(&[]));
        assert_eq!(node.membership(), Membership::Idle);

        node.tick().await;
        assert!(node.is_primary());
        assert_eq!(node.primary_address().as_deref(), Some("a:1"));
        assert!(node.lease_expires_at().is_some());

        node.step_down().unwrap();
        assert!(node.is_replica());
        assert!(node.primary_address().is_none());
        assert!(node.lock.read(PRIMARY).unwrap().is_empty());
        assert!(matches!(node.step_down(), Err(ClusterError::NotPrimary)));
    }

    #[tokio::test]
    async fn test_follower_follows_live_primary() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir, "b", "b:1", cluster(&[("a", "a:1")]));
        node.lock.try_lock(PRIMARY).unwrap().unwrap().write(b"a:1").unwrap();
        node.lock
            .try_lock(LEASE)
            .unwrap()
            .unwrap()
            .write((basalt_core::unix_secs() + 30).to_string().as_bytes())
            .unwrap();

        node.tick().await;
        assert!(node.is_replica());
        assert_eq!(node.primary_address().as_deref(), Some("a:1"));
    }

    #[tokio::test]
    async fn test_primary_demotes_when_marker_changes() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir, "a", "a:1", cluster(&[]));
        assert!(node.run_election().await.unwrap());

        // Another node took over. A low-water mark above the lease duration
        // makes the next tick renew, which must notice.
        node.lock.try_lock(PRIMARY).unwrap().unwrap().write(b"z:1").unwrap();
        let expires_at = node.lease_expires_at().unwrap();
        *node.lease.lock() = Some(Lease::new(
            "a:1",
            Arc::clone(&node.lock),
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(60),
            expires_at,
        ));

        node.tick().await;
        assert!(node.is_replica());
        assert!(node.lease_expires_at().is_none());
        assert!(node.primary_address().is_none());
    }

    #[tokio::test]
    async fn test_primary_tick_renews_lease() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir, "a", "a:1", cluster(&[]));
        assert!(node.run_election().await.unwrap());

        // A lease about to run out with a low-water mark that forces renewal.
        let soon = basalt_core::unix_secs() + 2;
        node.lock.try_lock(LEASE).unwrap().unwrap().write(soon.to_string().as_bytes()).unwrap();
        *node.lease.lock() = Some(Lease::new(
            "a:1",
            Arc::clone(&node.lock),
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(10),
            soon,
        ));

        node.tick().await;
        assert!(node.is_primary());
        let renewed = node.lease_expires_at().unwrap();
        assert!(renewed >= soon + 20);
        assert_eq!(
            crate::lock::parse_lease(&node.lock.read(LEASE).unwrap()).unwrap(),
            Some(renewed)
        );
    }

    #[tokio::test]
    async fn test_vote_rules() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir, "c", "c:1", cluster(&[("a", "a:1"), ("b", "b:1")]));

        assert!(node.grant_vote(&vote("a")));
        // Same candidate may ask again; a different one must wait for the window.
        assert!(node.grant_vote(&vote("a")));
        assert!(!node.grant_vote(&vote("b")));
        // Unknown members never get a vote.
        assert!(!node.grant_vote(&vote("x")));

        let mut expired = vote("b");
        *node.vote.lock() = Some(CastVote { candidate: "a".into(), ends_at: unix_millis() - 1 });
        expired.ends_at = unix_millis() + 3_000;
        assert!(node.grant_vote(&expired));
    }

    #[tokio::test]
    async fn test_vote_refused_with_live_primary() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir, "c", "c:1", cluster(&[("a", "a:1"), ("b", "b:1")]));
        node.lock.try_lock(PRIMARY).unwrap().unwrap().write(b"a:1").unwrap();
        node.lock
            .try_lock(LEASE)
            .unwrap()
            .unwrap()
            .write((basalt_core::unix_secs() + 30).to_string().as_bytes())
            .unwrap();

        assert!(!node.grant_vote(&vote("b")));
        assert!(node.grant_vote(&vote("a")));
    }

    #[tokio::test]
    async fn test_heartbeat_makes_idle_node_replica() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir, "b", "b:1", cluster(&[("a", "a:1")]));

        let response = node
            .handle_message(ClusterMessage::Heartbeat(HeartbeatMessage {
                address: "a:1".into(),
                id: "a".into(),
                time: unix_millis(),
            }))
            .await;
        assert!(matches!(response, ClusterResponse::Heartbeat(_)));
        assert!(node.is_replica());
        assert_eq!(node.primary_address().as_deref(), Some("a:1"));
    }

    #[tokio::test]
    async fn test_wal_usage_answers_and_survey() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let lock: Arc<dyn DistributedLock> = Arc::new(FileLock::new(dir.path()).unwrap());

        let primary = Node::new(
            "a",
            "a:1",
            cluster(&[("b", "b:1"), ("c", "c:1")]),
            Arc::clone(&lock),
            transport.clone(),
        );
        let replica: Arc<dyn MessageHandler> = Arc::new(Node::new(
            "b",
            "b:1",
            cluster(&[("a", "a:1"), ("c", "c:1")]),
            Arc::clone(&lock),
            transport.clone(),
        ));
        transport.register("b:1", &replica);

        let usage: Arc<dyn WalUsageProvider> = Arc::new(Usage(vec![30, 20]));
        let branch = BranchKey::new("db", "main");

        // The replica has no provider yet; "c" is unreachable.
        let result = primary.survey(&branch).await;
        assert_eq!(result.surveyed, 2);
        assert_eq!(result.responded, 1);
        assert_eq!(result.oldest_version, None);
        assert!(!result.is_complete());

        let response = primary
            .handle_message(ClusterMessage::WalVersionUsage(WalVersionUsageRequest {
                database_id: "db".into(),
                branch_id: "main".into(),
            }))
            .await;
        assert_eq!(
            response,
            ClusterResponse::WalVersionUsage(WalVersionUsageResponse { versions: Vec::new() })
        );

        primary.set_wal_usage_provider(&usage);
        let response = primary
            .handle_message(ClusterMessage::WalVersionUsage(WalVersionUsageRequest {
                database_id: "db".into(),
                branch_id: "main".into(),
            }))
            .await;
        assert_eq!(
            response,
            ClusterResponse::WalVersionUsage(WalVersionUsageResponse { versions: vec![30, 20] })
        );
    }

    #[tokio::test]
    async fn test_survey_reports_oldest_version() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(LocalTransport::new());
        let lock: Arc<dyn DistributedLock> = Arc::new(FileLock::new(dir.path()).unwrap());

        let primary =
            Node::new("a", "a:1", cluster(&[("b", "b:1")]), Arc::clone(&lock), transport.clone());
        let replica = Arc::new(Node::new(
            "b",
            "b:1",
            cluster(&[("a", "a:1")]),
            Arc::clone(&lock),
            transport.clone(),
        ));
        let usage: Arc<dyn WalUsageProvider> = Arc::new(Usage(vec![30, 20]));
        replica.set_wal_usage_provider(&usage);
        let handler: Arc<dyn MessageHandler> = replica;
        transport.register("b:1", &handler);

        let result = primary.survey(&BranchKey::new("db", "main")).await;
        assert!(result.is_complete());
        assert_eq!(result.oldest_version, Some(20));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = cluster(&[]);
        config.monitor_interval_ms = 20;
        let node = Arc::new(node(&dir, "a", "a:1", config));

        let handle = node.start();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !node.is_primary() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        node.shutdown().unwrap();
        handle.await.unwrap();
        assert!(!node.is_primary());
        assert!(node.lock.read(LEASE).unwrap().is_empty());
    }
}
