// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Message delivery between cluster members.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use basalt_core::PeerConfig;
use dashmap::{DashMap, DashSet};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::error;

use crate::error::{ClusterError, Result};
use crate::message::{ClusterMessage, ClusterResponse};

/// Delivers cluster messages to peers by address.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Sends `message` to the member at `address` and waits for its reply.
    async fn send(&self, address: &str, message: ClusterMessage) -> Result<ClusterResponse>;
}

/// Handles messages arriving at the local node.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produces the reply to `message`.
    async fn handle_message(&self, message: ClusterMessage) -> ClusterResponse;
}

/// In-process transport routing messages to registered handlers.
///
/// Used to run several nodes inside one process, and to simulate partitions
/// by disconnecting addresses.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<String, Weak<dyn MessageHandler>>,
    disconnected: DashSet<String>,
}

impl LocalTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes messages for `address` to `handler`.
    ///
    /// Only a weak reference is kept, so a dropped node becomes unreachable.
    pub fn register(&self, address: impl Into<String>, handler: &Arc<dyn MessageHandler>) {
        self.handlers.insert(address.into(), Arc::downgrade(handler));
    }

    /// Makes `address` unreachable until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self, address: &str) {
        self.disconnected.insert(address.to_string());
    }

    /// Makes `address` reachable again.
    pub fn reconnect(&self, address: &str) {
        self.disconnected.remove(address);
    }
}

#[async_trait]
impl ClusterTransport for LocalTransport {
    async fn send(&self, address: &str, message: ClusterMessage) -> Result<ClusterResponse> {
        let unreachable_peer = |reason: &str| ClusterError::Transport {
            peer: address.to_string(),
            reason: reason.to_string(),
        };

        if self.disconnected.contains(address) {
            return Err(unreachable_peer("disconnected"));
        }
        let handler = self
            .handlers
            .get(address)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| unreachable_peer("no such member"))?;

        Ok(handler.handle_message(message).await)
    }
}

/// Sends `message` to every peer concurrently and collects the replies.
///
/// Each request gets `per_request` to complete, and the whole fan-out ends
/// at `deadline`. Every peer appears exactly once in the result; a peer that
/// timed out or whose task failed carries a transport error.
pub async fn fan_out(
    transport: &Arc<dyn ClusterTransport>,
    peers: &[PeerConfig],
    message: ClusterMessage,
    per_request: Duration,
    deadline: Instant,
) -> Vec<(PeerConfig, Result<ClusterResponse>)> {
    let mut handles = Vec::with_capacity(peers.len());
    for peer in peers {
        let transport = Arc::clone(transport);
        let message = message.clone();
        let address = peer.address.clone();
        handles.push((
            peer.clone(),
            tokio::spawn(async move {
                match timeout(per_request, transport.send(&address, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(ClusterError::Transport {
                        peer: address,
                        reason: format!("no reply within {per_request:?}"),
                    }),
                }
            }),
        ));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (peer, handle) in handles {
        let result = match timeout_at(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(peer = %peer.address, error = %e, "Cluster request task failed");
                Err(ClusterError::Transport { peer: peer.address.clone(), reason: e.to_string() })
            }
            Err(_) => Err(ClusterError::Transport {
                peer: peer.address.clone(),
                reason: "deadline exceeded".to_string(),
            }),
        };
        results.push((peer, result));
    }
    results
}
