//! The top-level handle owning the engine, the Raft node and its RPC server.

use crate::coordinator::{Coordinator, StoreStats};
use crate::error::Result;
use crate::fsm::SqlStateMachine;
use engine::{ExecuteResult, QueryResult, SqliteEngine, StorageEngine};
use raft::{
    ClusterNode, Consensus, NodeConfig, NodeId, RaftConsensus, RaftHttpState, Role, ServerHandle,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Directory under the base holding the live database.
pub const SQLITE_DIR: &str = "sqlite";

/// Directory under the base holding the Raft log, state and snapshots.
pub const RAFT_DIR: &str = "raft";

/// A replicated SQL store on one node.
pub struct Store {
    base: PathBuf,
    node_id: NodeId,
    node: ClusterNode,
    raft_addr: SocketAddr,
    engine: Arc<SqliteEngine>,
    consensus: RaftConsensus,
    coordinator: Coordinator,
    rpc_server: Mutex<Option<ServerHandle>>,
    closed: AtomicBool,
}

impl Store {
    /// Open the store rooted at `base` and start its Raft node.
    ///
    /// The local database is wiped and rebuilt from the latest snapshot and
    /// the committed log. The Raft RPC server is bound to
    /// `config.raft_addr`; port 0 picks a free port, and the member record
    /// advertises the bound address.
    ///
    /// The node joins no cluster on its own: call [`Store::bootstrap`] or
    /// have the leader [`join`](Store::join) it.
    pub async fn open(base: impl AsRef<Path>, config: NodeConfig) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let sqlite_dir = base.join(SQLITE_DIR);
        if tokio::fs::try_exists(&sqlite_dir).await? {
            tokio::fs::remove_dir_all(&sqlite_dir).await?;
        }
        let engine = Arc::new(SqliteEngine::open(&sqlite_dir).await?);

        let listener = TcpListener::bind(&config.raft_addr).await?;
        let raft_addr = listener.local_addr()?;
        let mut config = NodeConfig {
            data_dir: base.join(RAFT_DIR),
            ..config
        };
        if config.raft_addr.ends_with(":0") {
            config.raft_addr = raft_addr.to_string();
        }

        let fsm = Arc::new(SqlStateMachine::new(engine.clone()));
        let (consensus, _log_store) = raft::start_node(&config, fsm).await?;
        let rpc_server = raft::serve(listener, RaftHttpState::new(consensus.raft().clone()))?;

        let coordinator = Coordinator::new(Arc::new(consensus.clone()), engine.clone())
            .with_apply_timeout(config.apply_timeout)
            .with_join_timeout(config.join_timeout);

        info!(
            node_id = config.node_id,
            base = %base.display(),
            raft_addr = %raft_addr,
            "store opened"
        );
        Ok(Self {
            base,
            node_id: config.node_id,
            node: config.cluster_node(),
            raft_addr,
            engine,
            consensus,
            coordinator,
            rpc_server: Mutex::new(Some(rpc_server)),
            closed: AtomicBool::new(false),
        })
    }

    /// Make this node the sole voter of a new cluster. A node that already
    /// has cluster state keeps it.
    pub async fn bootstrap(&self) -> Result<()> {
        self.consensus.initialize(self.node.clone()).await?;
        Ok(())
    }

    pub async fn execute(&self, sql: &str) -> Result<ExecuteResult> {
        self.coordinator.execute(sql).await
    }

    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.coordinator.query(sql).await
    }

    pub async fn join(&self, node_id: NodeId, node: ClusterNode) -> Result<()> {
        self.coordinator.join(node_id, node).await
    }

    /// Client address of the current leader.
    pub fn leader(&self) -> Option<String> {
        self.coordinator.leader()
    }

    pub fn role(&self) -> Role {
        self.coordinator.role()
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.coordinator.stats().await
    }

    /// Wait until some node is known to lead, returning its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        Ok(self.consensus.wait_for_leader(timeout).await?)
    }

    /// Resolve once the Raft node has failed, with the failure. `None` means
    /// it was shut down normally.
    pub async fn wait_fatal(&self) -> Option<String> {
        self.consensus.wait_fatal().await
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// This node's member record.
    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    /// Address the Raft RPC server is bound to.
    pub fn raft_addr(&self) -> SocketAddr {
        self.raft_addr
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn consensus(&self) -> &RaftConsensus {
        &self.consensus
    }

    /// Stop the Raft node, its RPC server, then close the engine. Calling it
    /// again does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node_id = self.node_id, "closing store");

        if let Err(e) = self.consensus.shutdown().await {
            warn!(error = %e, "raft shutdown failed");
        }
        if let Some(mut server) = self.rpc_server.lock().await.take() {
            server.shutdown();
            if let Err(e) = server.wait().await {
                warn!(error = %e, "raft rpc server stopped with error");
            }
        }
        self.engine.close().await?;
        Ok(())
    }
}
