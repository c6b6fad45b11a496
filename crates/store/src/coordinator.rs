//! Cluster coordinator: the store's view of the consensus node.
//!
//! Writes are encoded as [`Command`]s and submitted through [`Consensus`];
//! reads go straight to the local engine. Consensus outcomes are translated
//! into [`StoreError`].

use crate::command::Command;
use crate::error::{Result, StoreError};
use engine::{ExecuteResult, QueryResult, StorageEngine};
use raft::{ApplyResponse, ClusterNode, Consensus, ConsensusStats, NodeId, Role};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on waiting for a write to be committed and applied.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a join's membership changes.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the local database lives and how large it is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub path: PathBuf,
    pub size: u64,
}

/// Snapshot of the node's state for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub consensus: ConsensusStats,
    /// Client address of the leader.
    pub leader: Option<String>,
    pub storage: StorageStats,
}

pub struct Coordinator {
    consensus: Arc<dyn Consensus>,
    engine: Arc<dyn StorageEngine>,
    apply_timeout: Duration,
    join_timeout: Duration,
}

impl Coordinator {
    pub fn new(consensus: Arc<dyn Consensus>, engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            consensus,
            engine,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Replicate `sql` and return its outcome once applied locally.
    ///
    /// Fails fast with [`StoreError::NotLeader`] on any node but the leader.
    pub async fn execute(&self, sql: &str) -> Result<ExecuteResult> {
        if self.consensus.role() != Role::Leader {
            return Err(StoreError::NotLeader {
                leader: self.leader(),
            });
        }

        let payload = Command::new(sql).encode()?;
        match self.consensus.submit(payload, self.apply_timeout).await? {
            ApplyResponse::Executed { rows_affected } => Ok(ExecuteResult { rows_affected }),
            ApplyResponse::Failed { message } => Err(StoreError::Execution(message)),
            ApplyResponse::Skipped => Err(StoreError::Consensus(
                "command entry was not applied".to_string(),
            )),
        }
    }

    /// Run a read against the local engine. Never touches consensus.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.engine
            .query(sql)
            .await
            .map_err(|e| StoreError::Execution(e.to_string()))
    }

    /// Add `node_id` at `node` as a voter.
    ///
    /// Joining with the exact same record is a no-op once the node votes; a
    /// matching learner, left behind by an interrupted join, is promoted. A
    /// member already using the id or the transport address is removed first.
    pub async fn join(&self, node_id: NodeId, node: ClusterNode) -> Result<()> {
        for member in self.consensus.configuration() {
            let same_id = member.id == node_id;
            let same_addr = member.node.raft_addr == node.raft_addr;

            if same_id && member.node == node {
                if member.voter {
                    info!(node_id, %node, "node already member of cluster, ignoring join");
                    return Ok(());
                }
                info!(node_id, %node, "promoting existing learner");
                self.consensus
                    .add_voter(node_id, node, self.join_timeout)
                    .await?;
                return Ok(());
            }
            if same_id || same_addr {
                info!(
                    stale_id = member.id,
                    stale = %member.node,
                    node_id,
                    "removing stale member before join"
                );
                self.consensus
                    .remove_server(member.id, self.join_timeout)
                    .await
                    .map_err(|e| {
                        warn!(stale_id = member.id, error = %e, "failed to remove stale member");
                        StoreError::from(e)
                    })?;
            }
        }

        self.consensus
            .add_voter(node_id, node.clone(), self.join_timeout)
            .await?;
        info!(node_id, %node, "node joined cluster");
        Ok(())
    }

    /// Client address of the current leader.
    pub fn leader(&self) -> Option<String> {
        self.consensus.leader().map(|(_, node)| node.client_addr)
    }

    pub fn role(&self) -> Role {
        self.consensus.role()
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let path = self.engine.path().to_path_buf();
        let size = dir_size(&path).await?;
        Ok(StoreStats {
            consensus: self.consensus.stats(),
            leader: self.leader(),
            storage: StorageStats { path, size },
        })
    }

    pub fn consensus(&self) -> &Arc<dyn Consensus> {
        &self.consensus
    }
}

/// Sum of file sizes directly inside `dir`.
async fn dir_size(dir: &Path) -> Result<u64> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut total = 0;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    debug!(path = %dir.display(), bytes = total, "measured storage");
    Ok(total)
}
