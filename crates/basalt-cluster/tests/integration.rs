// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for leadership across several nodes.

use std::sync::Arc;
use std::time::Duration;

use basalt_cluster::{
    ClusterTransport, DistributedLock, FileLock, LocalTransport, MessageHandler, Node,
};
use basalt_core::{ClusterConfig, NodeRole, PeerConfig};
use tempfile::TempDir;

const MEMBERS: [(&str, &str); 3] = [("n1", "n1:7000"), ("n2", "n2:7000"), ("n3", "n3:7000")];

fn config_for(id: &str) -> ClusterConfig {
    ClusterConfig {
        peers: MEMBERS
            .iter()
            .filter(|(peer, _)| *peer != id)
            .map(|(peer, address)| PeerConfig { id: (*peer).into(), address: (*address).into() })
            .collect(),
        election_jitter_min_ms: 10,
        election_jitter_max_ms: 200,
        election_timeout_ms: 1_000,
        vote_request_timeout_ms: 1_000,
        heartbeat_interval_ms: 100,
        monitor_interval_ms: 100,
        request_timeout_ms: 500,
        ..ClusterConfig::default()
    }
}

/// Starts every member against one shared directory and transport.
fn start_cluster(dir: &TempDir, transport: &Arc<LocalTransport>) -> Vec<Arc<Node>> {
    MEMBERS
        .iter()
        .map(|(id, address)| {
            let lock: Arc<dyn DistributedLock> = Arc::new(FileLock::new(dir.path()).unwrap());
            let cluster_transport: Arc<dyn ClusterTransport> = transport.clone();
            let node = Arc::new(Node::new(*id, *address, config_for(id), lock, cluster_transport));
            let handler: Arc<dyn MessageHandler> = node.clone();
            transport.register(*address, &handler);
            node
        })
        .collect()
}

async fn wait_for_single_primary(nodes: &[Arc<Node>], within: Duration) -> Arc<Node> {
    tokio::time::timeout(within, async {
        loop {
            let primaries: Vec<_> = nodes.iter().filter(|n| n.is_primary()).collect();
            if primaries.len() == 1 {
                let primary = primaries[0];
                let agreed = nodes
                    .iter()
                    .all(|n| n.primary_address().as_deref() == Some(primary.address()));
                if agreed {
                    return Arc::clone(primary);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("cluster did not settle on one primary")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_elect_exactly_one_primary() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(LocalTransport::new());
    let nodes = start_cluster(&dir, &transport);
    let handles: Vec<_> = nodes.iter().map(Node::start).collect();

    let primary = wait_for_single_primary(&nodes, Duration::from_secs(3)).await;

    // Leadership is stable: still exactly one primary a little later.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(nodes.iter().filter(|n| n.is_primary()).count(), 1);
    assert!(primary.is_primary());
    for node in nodes.iter().filter(|n| !n.is_primary()) {
        assert!(node.is_replica());
        assert_eq!(node.primary_address().as_deref(), Some(primary.address()));
    }

    for node in &nodes {
        node.shutdown().unwrap();
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_step_down_hands_over_leadership() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(LocalTransport::new());
    let nodes = start_cluster(&dir, &transport);
    let handles: Vec<_> = nodes.iter().map(Node::start).collect();

    let first = wait_for_single_primary(&nodes, Duration::from_secs(3)).await;
    // Take the old primary out so it cannot win again.
    transport.disconnect(first.address());
    first.shutdown().unwrap();

    let rest: Vec<_> = nodes.iter().filter(|n| n.id() != first.id()).cloned().collect();
    let second = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(node) = rest.iter().find(|n| n.is_primary()) {
                return Arc::clone(node);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no new primary after step-down");
    assert_ne!(second.id(), first.id());
    assert!(!first.is_primary());

    for node in &nodes {
        node.shutdown().unwrap();
    }
    for handle in handles {
        handle.await.unwrap();
    }
}
