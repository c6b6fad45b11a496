//! Raft transport between nodes: JSON over HTTP.
//!
//! Every RPC endpoint answers `200` with a JSON `Result<response, RaftError>`,
//! so a refusal by the remote Raft (e.g. it has shut down) arrives as a
//! [`RemoteError`] and not as a transport failure. The peer address comes
//! from the [`ClusterNode`] record in the membership config.

use crate::type_config::TypeConfig;
use crate::{ClusterNode, NodeId};
use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::time::Duration;
use tracing::{debug, trace};

pub const APPEND_ENTRIES_PATH: &str = "/raft/append_entries";
pub const VOTE_PATH: &str = "/raft/vote";
pub const INSTALL_SNAPSHOT_PATH: &str = "/raft/install_snapshot";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Hands out one [`HttpNetwork`] per peer, all sharing a connection pool.
#[derive(Clone)]
pub struct HttpNetworkFactory {
    node_id: NodeId,
    client: reqwest::Client,
}

impl HttpNetworkFactory {
    pub fn new(node_id: NodeId) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { node_id, client })
    }
}

impl std::fmt::Debug for HttpNetworkFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetworkFactory")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &ClusterNode) -> Self::Network {
        debug!(from = self.node_id, target, addr = %node.raft_addr, "opening raft peer");
        HttpNetwork::new(target, node.clone(), self.client.clone())
    }
}

fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

/// Transport-level outcome of one RPC, before it is shaped into the
/// [`RPCError`] the caller expects.
#[derive(Debug)]
enum CallError<E> {
    /// Nothing answered; openraft backs off before retrying.
    Unreachable(io::Error),
    /// Something answered, but not with a usable RPC response.
    Network(io::Error),
    /// The peer's Raft rejected the request.
    Remote(E),
}

impl<E> CallError<E>
where
    E: std::error::Error,
{
    fn into_rpc(self, target: NodeId, node: &ClusterNode) -> RPCError<NodeId, ClusterNode, E> {
        match self {
            CallError::Unreachable(e) => RPCError::Unreachable(Unreachable::new(&e)),
            CallError::Network(e) => RPCError::Network(NetworkError::new(&e)),
            CallError::Remote(e) => {
                RPCError::RemoteError(RemoteError::new_with_node(target, node.clone(), e))
            }
        }
    }
}

/// Connection to a single Raft peer.
#[derive(Clone)]
pub struct HttpNetwork {
    target: NodeId,
    node: ClusterNode,
    base_url: String,
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new(target: NodeId, node: ClusterNode, client: reqwest::Client) -> Self {
        Self {
            target,
            base_url: base_url(&node.raft_addr),
            node,
            client,
        }
    }

    async fn call<Req, Resp, E>(
        &self,
        path: &str,
        request: &Req,
        deadline: Duration,
    ) -> Result<Resp, CallError<E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        trace!(target_node = self.target, %url, "raft rpc");

        let response = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    io::ErrorKind::TimedOut
                } else {
                    io::ErrorKind::ConnectionRefused
                };
                CallError::Unreachable(io::Error::new(kind, e.to_string()))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Network(io::Error::other(format!(
                "{} answered {}: {}",
                url, status, body
            ))));
        }

        let outcome: Result<Resp, E> = response
            .json()
            .await
            .map_err(|e| CallError::Network(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        outcome.map_err(CallError::Remote)
    }
}

impl std::fmt::Debug for HttpNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetwork")
            .field("target", &self.target)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, ClusterNode, RaftError<NodeId>>>
    {
        self.call(APPEND_ENTRIES_PATH, &req, option.hard_ttl())
            .await
            .map_err(|e| e.into_rpc(self.target, &self.node))
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, ClusterNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.call(INSTALL_SNAPSHOT_PATH, &req, option.hard_ttl())
            .await
            .map_err(|e| e.into_rpc(self.target, &self.node))
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, ClusterNode, RaftError<NodeId>>> {
        self.call(VOTE_PATH, &req, option.hard_ttl())
            .await
            .map_err(|e| e.into_rpc(self.target, &self.node))
    }
}
