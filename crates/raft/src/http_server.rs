//! Raft RPC endpoints served to peers.
//!
//! Each handler passes the request to the local Raft and replies `200` with
//! the JSON-encoded `Result`, which [`HttpNetwork`](crate::HttpNetwork)
//! decodes on the other side. Only malformed requests get another status.

use crate::consensus::role_from_state;
use crate::network::{APPEND_ENTRIES_PATH, INSTALL_SNAPSHOT_PATH, VOTE_PATH};
use crate::type_config::TypeConfig;
use crate::{NodeId, RaftNode};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RaftHttpState {
    pub raft: Arc<RaftNode>,
}

impl RaftHttpState {
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self { raft }
    }
}

pub fn create_router(state: RaftHttpState) -> Router {
    Router::new()
        .route(APPEND_ENTRIES_PATH, post(append_entries))
        .route(VOTE_PATH, post(vote))
        .route(INSTALL_SNAPSHOT_PATH, post(install_snapshot))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve the Raft endpoints on `listener` in a background task.
pub fn serve(listener: TcpListener, state: RaftHttpState) -> std::io::Result<ServerHandle> {
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = create_router(state);

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    info!(addr = %local_addr, "raft rpc server listening");
    Ok(ServerHandle {
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

/// A running RPC server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections; in-flight requests finish.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    pub async fn wait(self) -> std::io::Result<()> {
        self.task
            .await
            .map_err(|e| std::io::Error::other(format!("raft rpc server task failed: {}", e)))?
    }
}

type RpcReply<T, E = openraft::error::Infallible> = Json<Result<T, RaftError<NodeId, E>>>;

async fn append_entries(
    State(state): State<RaftHttpState>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> RpcReply<AppendEntriesResponse<NodeId>> {
    let result = state.raft.append_entries(req).await;
    if let Err(e) = &result {
        debug!(error = %e, "append entries rejected");
    }
    Json(result)
}

async fn vote(
    State(state): State<RaftHttpState>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> RpcReply<VoteResponse<NodeId>> {
    let result = state.raft.vote(req).await;
    if let Err(e) = &result {
        debug!(error = %e, "vote rejected");
    }
    Json(result)
}

async fn install_snapshot(
    State(state): State<RaftHttpState>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> RpcReply<InstallSnapshotResponse<NodeId>, InstallSnapshotError> {
    let result = state.raft.install_snapshot(req).await;
    if let Err(e) = &result {
        debug!(error = %e, "install snapshot rejected");
    }
    Json(result)
}

#[derive(Debug, Serialize)]
struct Health {
    healthy: bool,
    node_id: NodeId,
    role: crate::Role,
    term: u64,
    leader: Option<NodeId>,
    last_log_index: Option<u64>,
    last_applied: Option<u64>,
}

async fn health(State(state): State<RaftHttpState>) -> Json<Health> {
    let metrics = state.raft.metrics().borrow().clone();
    Json(Health {
        healthy: metrics.running_state.is_ok(),
        node_id: metrics.id,
        role: role_from_state(metrics.state),
        term: metrics.current_term,
        leader: metrics.current_leader,
        last_log_index: metrics.last_log_index,
        last_applied: metrics.last_applied.map(|id| id.index),
    })
}
