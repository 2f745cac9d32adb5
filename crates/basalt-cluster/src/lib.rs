// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Leadership for Basalt clusters.
//!
//! This crate provides:
//! - Advisory file locks over the shared `_cluster/` markers
//! - Majority-vote primary election
//! - The primary's time-bound lease
//! - A [`Node`] state machine driving election, renewal and heartbeats
//! - Cluster wire messages and their transports (in-process and HTTP)
//!
//! # Architecture
//!
//! All members share one network file system. Leadership is recorded in two
//! files there: `_cluster/PRIMARY` names the primary's address and
//! `_cluster/LEASE` holds the lease expiry. Both are only written while their
//! advisory lock is held:
//! 1. A node with no live primary in the markers starts an election
//! 2. The candidate locks `PRIMARY` and asks every peer for a vote
//! 3. With a majority it writes its address and an initial lease
//! 4. The primary renews the lease before it runs low and heartbeats peers
//! 5. Replicas follow the primary named by the markers or by heartbeats
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use basalt_cluster::{HttpTransport, Node};
//!
//! let transport = Arc::new(HttpTransport::new(config.cluster.request_timeout())?);
//! let node = Arc::new(Node::from_config(&config, transport)?);
//! let monitor = node.start();
//!
//! let app = basalt_cluster::router(Arc::clone(&node));
//! // serve `app`, then on exit:
//! node.shutdown()?;
//! monitor.await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod election;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod lease;
pub mod lock;
pub mod message;
pub mod metrics;
pub mod node;
pub mod transport;

pub use election::Election;
pub use error::{ClusterError, Result};
pub use heartbeat::{HeartbeatTracker, PeerHealth, PeerState, PrimaryContact};
pub use http::{fetch_status, router, HttpTransport};
pub use lease::{live_primary, Lease, LeaseRenewal};
pub use lock::{DistributedLock, FileLock, MarkerGuard};
pub use message::{
    ClusterMessage, ClusterResponse, HeartbeatMessage, HeartbeatResponse, VoteRequest,
    VoteResponse, WalVersionUsageRequest, WalVersionUsageResponse,
};
pub use metrics::init_cluster_metrics;
pub use node::{Node, NodeStatus};
pub use transport::{fan_out, ClusterTransport, LocalTransport, MessageHandler};
