//! Raft node configuration.

use crate::{ClusterNode, NodeId};
use openraft::SnapshotPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a Raft node in the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Directory for the Raft log, state file and snapshots.
    pub data_dir: PathBuf,

    /// Address the Raft RPC server listens on (e.g., "127.0.0.1:4002").
    pub raft_addr: String,

    /// Address the client HTTP API listens on (e.g., "127.0.0.1:4001").
    pub client_addr: String,

    /// Election timeout range in milliseconds.
    /// A random value within this range is used for each election.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Number of applied entries since the last snapshot that triggers a new one.
    pub snapshot_threshold: u64,

    /// Entries kept in the log after a snapshot, for slow followers.
    pub logs_to_keep: u64,

    /// Snapshots kept on disk; older ones are deleted.
    pub retain_snapshots: usize,

    /// How long a write waits to be committed and applied.
    pub apply_timeout: Duration,

    /// How long a membership change may take.
    pub join_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            data_dir: PathBuf::from("./raft_data"),
            raft_addr: "localhost:9302".to_string(),
            client_addr: "localhost:9301".to_string(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            snapshot_threshold: 8192,
            logs_to_keep: 1024,
            retain_snapshots: 2,
            apply_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(30),
        }
    }
}

impl NodeConfig {
    /// Create a new node configuration.
    pub fn new(node_id: NodeId, data_dir: PathBuf) -> Self {
        Self {
            node_id,
            data_dir,
            ..Default::default()
        }
    }

    /// Set the Raft RPC address.
    pub fn with_raft_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_addr = addr.into();
        self
    }

    /// Set the client API address.
    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = addr.into();
        self
    }

    /// Set election timeout range.
    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set heartbeat interval.
    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set how many applied entries trigger a snapshot, and how many entries
    /// survive log compaction.
    pub fn with_snapshot_threshold(mut self, threshold: u64, logs_to_keep: u64) -> Self {
        self.snapshot_threshold = threshold;
        self.logs_to_keep = logs_to_keep;
        self
    }

    pub fn with_retain_snapshots(mut self, count: usize) -> Self {
        self.retain_snapshots = count.max(1);
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// This node's membership record.
    pub fn cluster_node(&self) -> ClusterNode {
        ClusterNode::new(&self.raft_addr, &self.client_addr)
    }

    /// Path to the Raft log file.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("raft.log")
    }

    /// Path to the Raft state file (vote, committed, purge point).
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("raft_state.json")
    }

    /// Path to the snapshot directory.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Build OpenRaft config from this node config.
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "sqlraft".to_string(),
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            heartbeat_interval: self.heartbeat_interval_ms,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: self.logs_to_keep,
            ..Default::default()
        }
    }
}
