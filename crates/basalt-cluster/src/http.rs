// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Cluster messaging over HTTP.
//!
//! Every member serves:
//!
//! - `POST /cluster/message`: a JSON [`ClusterMessage`], answered with the
//!   JSON [`ClusterResponse`]. A refused vote is answered with
//!   `409 Conflict`, so any non-200 reply to a vote request means "no".
//! - `GET /cluster/status`: the node's [`NodeStatus`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use tracing::trace;

use crate::error::{ClusterError, Result};
use crate::message::{ClusterMessage, ClusterResponse, VoteResponse};
use crate::node::{Node, NodeStatus};
use crate::transport::{ClusterTransport, MessageHandler};

/// Path of the message endpoint.
pub const MESSAGE_PATH: &str = "/cluster/message";

/// Path of the status endpoint.
pub const STATUS_PATH: &str = "/cluster/status";

/// [`ClusterTransport`] posting JSON messages to peers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Transport { peer: String::new(), reason: e.to_string() })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ClusterTransport for HttpTransport {
    async fn send(&self, address: &str, message: ClusterMessage) -> Result<ClusterResponse> {
        let failed = |reason: String| ClusterError::Transport { peer: address.to_string(), reason };
        let is_vote = matches!(message, ClusterMessage::Vote(_));
        let kind = message.kind();

        let response = self
            .client
            .post(format!("http://{address}{MESSAGE_PATH}"))
            .json(&message)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        trace!(peer = %address, kind, status = status.as_u16(), "Cluster message answered");
        if !status.is_success() {
            if is_vote {
                return Ok(ClusterResponse::Vote(VoteResponse { granted: false }));
            }
            return Err(failed(format!("HTTP {status}")));
        }

        response.json().await.map_err(|e| failed(e.to_string()))
    }
}

/// Builds the cluster router for `node`.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route(MESSAGE_PATH, post(handle_message))
        .route(STATUS_PATH, get(handle_status))
        .with_state(node)
}

async fn handle_message(
    State(node): State<Arc<Node>>,
    Json(message): Json<ClusterMessage>,
) -> Response {
    match node.handle_message(message).await {
        response @ ClusterResponse::Vote(VoteResponse { granted: false }) => {
            (StatusCode::CONFLICT, Json(response)).into_response()
        }
        response => Json(response).into_response(),
    }
}

async fn handle_status(State(node): State<Arc<Node>>) -> Json<NodeStatus> {
    Json(node.status())
}

/// Fetches the status of the member at `address`.
pub async fn fetch_status(address: &str, timeout: Duration) -> Result<NodeStatus> {
    let failed = |reason: String| ClusterError::Transport { peer: address.to_string(), reason };
    let response = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?
        .get(format!("http://{address}{STATUS_PATH}"))
        .send()
        .await
        .map_err(|e| failed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }
    response.json().await.map_err(|e| failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use basalt_core::{ClusterConfig, Membership, PeerConfig};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::*;
    use crate::lock::{DistributedLock, FileLock};
    use crate::message::{HeartbeatMessage, VoteRequest};
    use crate::transport::LocalTransport;

    async fn serve(node: Arc<Node>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router(node)).await.unwrap();
        });
        address
    }

    fn node(dir: &TempDir, peers: Vec<PeerConfig>) -> Arc<Node> {
        let lock: Arc<dyn DistributedLock> = Arc::new(FileLock::new(dir.path()).unwrap());
        let config = ClusterConfig { peers, ..ClusterConfig::default() };
        Arc::new(Node::new("b", "b:1", config, lock, Arc::new(LocalTransport::new())))
    }

    #[tokio::test]
    async fn test_http_round_trip() {
        let dir = TempDir::new().unwrap();
        let peers = vec![
            PeerConfig { id: "a".into(), address: "a:1".into() },
            PeerConfig { id: "c".into(), address: "c:1".into() },
        ];
        let address = serve(node(&dir, peers)).await;
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();

        let response = transport
            .send(
                &address,
                ClusterMessage::Heartbeat(HeartbeatMessage {
                    address: "a:1".into(),
                    id: "a".into(),
                    time: 1,
                }),
            )
            .await
            .unwrap();
        assert!(matches!(response, ClusterResponse::Heartbeat(_)));

        let status = fetch_status(&address, Duration::from_secs(2)).await.unwrap();
        assert_eq!(status.membership, Membership::Replica);
        assert_eq!(status.primary_address.as_deref(), Some("a:1"));

        let vote = |candidate: &str| {
            ClusterMessage::Vote(VoteRequest {
                candidate: candidate.into(),
                seed: 9,
                started_at: basalt_core::unix_millis(),
                ends_at: basalt_core::unix_millis() + 3_000,
            })
        };
        let granted = transport.send(&address, vote("a")).await.unwrap();
        assert_eq!(granted, ClusterResponse::Vote(VoteResponse { granted: true }));
        // A second candidate in the same window is answered with 409.
        let refused = transport.send(&address, vote("c")).await.unwrap();
        assert_eq!(refused, ClusterResponse::Vote(VoteResponse { granted: false }));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_transport_error() {
        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = transport
            .send(
                &address,
                ClusterMessage::Heartbeat(HeartbeatMessage {
                    address: "a:1".into(),
                    id: "a".into(),
                    time: 1,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Transport { .. }));
    }
}
