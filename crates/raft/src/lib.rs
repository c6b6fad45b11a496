//! OpenRaft consensus integration for the replicated SQL store.
//!
//! This crate owns everything Raft-specific: durable log and snapshot
//! storage, the HTTP transport between nodes, and the [`Consensus`] view the
//! store works against. What a log entry *means* is left to a
//! [`StateMachine`] supplied by the caller.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Node                                        │
//! │  ┌───────────────┐     ┌──────────────┐     ┌───────────────────────┐   │
//! │  │ Coordinator   │────▶│ RaftConsensus│────▶│ PersistentRaftStore   │   │
//! │  │ (store crate) │     │  (RaftNode)  │     │ (log + snapshots)     │   │
//! │  └───────────────┘     └──────────────┘     └───────────────────────┘   │
//! │                               │                        │                │
//! │                               ▼                        ▼                │
//! │                        ┌──────────────┐     ┌───────────────────────┐   │
//! │                        │ HTTP Server  │     │   StateMachine        │   │
//! │                        │ (axum)       │     │ (apply/snapshot/      │   │
//! │                        └──────────────┘     │  restore)             │   │
//! │                                             └───────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                │
//!                    ┌───────────┴───────────┐
//!                    ▼                       ▼
//!          ┌──────────────────┐    ┌──────────────────┐
//!          │   Node 2         │    │   Node 3         │
//!          │ (HttpNetwork)    │    │ (HttpNetwork)    │
//!          └──────────────────┘    └──────────────────┘
//! ```
//!
//! # HTTP Endpoints
//!
//! Each node exposes the following Raft RPC endpoints:
//! - `POST /raft/append_entries` - Log replication from leader
//! - `POST /raft/vote` - Leader election votes
//! - `POST /raft/install_snapshot` - State transfer for new nodes
//! - `GET /health` - Node health and Raft status
//!
//! # Modules
//!
//! - [`command`]: Log payload and apply response types
//! - [`config`]: Node configuration (data directory, addresses, timeouts)
//! - [`consensus`]: The [`Consensus`] trait and its OpenRaft implementation
//! - [`http_server`]: Axum HTTP endpoints for Raft RPCs
//! - [`network`]: HTTP transport for inter-node communication
//! - [`node`]: Cluster member records
//! - [`persistent_storage`]: Durable Raft log and snapshot storage
//! - [`snapshot_store`]: Snapshot files on disk
//! - [`state_machine`]: The application state contract
//! - [`type_config`]: OpenRaft type configuration

pub mod command;
pub mod config;
pub mod consensus;
pub mod http_server;
pub mod network;
pub mod node;
pub mod persistent_storage;
pub mod snapshot_store;
pub mod state_machine;
pub mod type_config;

pub use command::{ApplyResponse, LogPayload};
pub use config::NodeConfig;
pub use consensus::{Consensus, ConsensusError, ConsensusStats, Member, RaftConsensus, Role};
pub use http_server::{create_router, serve, RaftHttpState, ServerHandle};
pub use network::{HttpNetwork, HttpNetworkFactory};
pub use node::{ClusterNode, IdentityError, MemberIdentity};
pub use persistent_storage::{create_persistent_storage, PersistentLogStore, PersistentRaftStore};
pub use snapshot_store::{FileSnapshotSink, SnapshotFile, SnapshotStore};
pub use state_machine::{SnapshotSink, StateMachine, StateMachineError, StateMachineSnapshot};
pub use type_config::TypeConfig;

use openraft::storage::Adaptor;
use openraft::Raft;
use std::sync::Arc;

/// The Raft consensus node type.
pub type RaftNode = Raft<TypeConfig>;

/// Node identifier type.
pub type NodeId = u64;

/// Errors starting a Raft node.
#[derive(thiserror::Error, Debug)]
pub enum StartError {
    #[error("invalid raft config: {0}")]
    Config(#[from] openraft::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("raft error: {0}")]
    Raft(#[from] openraft::error::Fatal<NodeId>),
}

/// Open durable storage for `config` and start a Raft node driving `fsm`.
///
/// The node is not part of any cluster yet; bootstrap it with
/// [`RaftConsensus::initialize`] or have a leader add it.
pub async fn start_node(
    config: &NodeConfig,
    fsm: Arc<dyn StateMachine>,
) -> Result<(RaftConsensus, PersistentLogStore), StartError> {
    let raft_config = Arc::new(config.to_openraft_config().validate()?);
    let store = create_persistent_storage(config, fsm).await?;
    let (log_store, state_machine) = Adaptor::<TypeConfig, PersistentLogStore>::new(store.clone());
    let network = HttpNetworkFactory::new(config.node_id)?;

    let raft = Raft::new(config.node_id, raft_config, network, log_store, state_machine).await?;
    tracing::info!(node_id = config.node_id, raft_addr = %config.raft_addr, "raft node started");

    Ok((RaftConsensus::new(config.node_id, Arc::new(raft)), store))
}
