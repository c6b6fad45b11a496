//! Consensus capability used by the store.
//!
//! [`Consensus`] is the narrow view of a Raft node that the cluster
//! coordinator works against: who leads, submit a payload, read and change
//! membership. [`RaftConsensus`] implements it on top of an OpenRaft node.

use crate::{ApplyResponse, ClusterNode, LogPayload, NodeId, RaftNode};
use async_trait::async_trait;
use openraft::error::{ClientWriteError, Fatal, InitializeError, RaftError};
use openraft::{ChangeMembers, ServerState};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Role of this node in the current term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Learners and stopped nodes take no part in elections; they count as followers.
pub fn role_from_state(state: ServerState) -> Role {
    match state {
        ServerState::Leader => Role::Leader,
        ServerState::Candidate => Role::Candidate,
        ServerState::Follower | ServerState::Learner | ServerState::Shutdown => Role::Follower,
    }
}

/// One entry of the cluster membership.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: NodeId,
    pub node: ClusterNode,
    pub voter: bool,
}

/// Counters describing the local consensus node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConsensusStats {
    pub node_id: NodeId,
    pub state: String,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub last_log_index: Option<u64>,
    pub last_applied: Option<u64>,
    pub snapshot_index: Option<u64>,
    pub purged_index: Option<u64>,
    pub voters: usize,
    pub learners: usize,
}

/// Errors surfaced by a consensus node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// This node cannot accept writes. Carries the leader when known.
    #[error("not the leader")]
    NotLeader { leader: Option<ClusterNode> },

    /// The operation did not finish in time. It may still take effect.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("membership change failed: {0}")]
    Membership(String),

    /// The node has stopped and will not recover.
    #[error("consensus node stopped: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

/// What the store needs from a consensus node.
#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    fn role(&self) -> Role;

    /// The current leader and its addresses, when known.
    fn leader(&self) -> Option<(NodeId, ClusterNode)>;

    /// Replicate `payload`, wait for it to be applied locally, and return the
    /// state machine's response.
    async fn submit(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ApplyResponse, ConsensusError>;

    /// Current membership, read fresh on every call.
    fn configuration(&self) -> Vec<Member>;

    /// Add `id` as a voter: first as a learner that catches up, then promoted.
    async fn add_voter(
        &self,
        id: NodeId,
        node: ClusterNode,
        timeout: Duration,
    ) -> Result<(), ConsensusError>;

    /// Remove `id` from the membership, voter or learner.
    async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<(), ConsensusError>;

    fn stats(&self) -> ConsensusStats;

    async fn shutdown(&self) -> Result<(), ConsensusError>;
}

/// [`Consensus`] backed by an OpenRaft node.
#[derive(Clone)]
pub struct RaftConsensus {
    node_id: NodeId,
    raft: Arc<RaftNode>,
}

impl RaftConsensus {
    pub fn new(node_id: NodeId, raft: Arc<RaftNode>) -> Self {
        Self { node_id, raft }
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Bootstrap a single-node cluster made of this node.
    ///
    /// A node that already has state keeps it; that is not an error.
    pub async fn initialize(&self, node: ClusterNode) -> Result<(), ConsensusError> {
        let mut members = BTreeMap::new();
        members.insert(self.node_id, node);

        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node_id = self.node_id, "bootstrapped single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!(node_id = self.node_id, "cluster already initialized");
                Ok(())
            }
            Err(e) => Err(ConsensusError::Other(e.to_string())),
        }
    }

    /// Wait until some node is known to lead.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, ConsensusError> {
        let mut rx = self.raft.metrics();
        let wait = async {
            loop {
                let leader = rx.borrow().current_leader;
                if let Some(leader) = leader {
                    return Ok(leader);
                }
                if rx.changed().await.is_err() {
                    return Err(ConsensusError::Fatal("raft node stopped".into()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ConsensusError::Timeout(timeout))?
    }

    /// Resolve once the node has failed. Returns the failure, or `None` when
    /// the node was shut down normally.
    pub async fn wait_fatal(&self) -> Option<String> {
        let mut rx = self.raft.metrics();
        loop {
            let running = rx.borrow().running_state.clone();
            match running {
                Ok(()) => {}
                Err(Fatal::Stopped) => return None,
                Err(fatal) => return Some(fatal.to_string()),
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    fn is_voter(&self, id: NodeId) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        let is_voter = metrics
            .membership_config
            .membership()
            .voter_ids()
            .any(|voter| voter == id);
        is_voter
    }
}

fn write_error(e: RaftError<NodeId, ClientWriteError<NodeId, ClusterNode>>) -> ConsensusError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
            ConsensusError::NotLeader {
                leader: forward.leader_node,
            }
        }
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            ConsensusError::Membership(e.to_string())
        }
        RaftError::Fatal(fatal) => ConsensusError::Fatal(fatal.to_string()),
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn role(&self) -> Role {
        let state = self.raft.metrics().borrow().state;
        role_from_state(state)
    }

    fn leader(&self) -> Option<(NodeId, ClusterNode)> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        let node = metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .cloned()?;
        Some((leader, node))
    }

    async fn submit(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ApplyResponse, ConsensusError> {
        match tokio::time::timeout(timeout, self.raft.client_write(LogPayload(payload))).await {
            Ok(Ok(response)) => Ok(response.data),
            Ok(Err(e)) => Err(write_error(e)),
            Err(_) => Err(ConsensusError::Timeout(timeout)),
        }
    }

    fn configuration(&self) -> Vec<Member> {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<NodeId> = membership.voter_ids().collect();
        membership
            .nodes()
            .map(|(id, node)| Member {
                id: *id,
                node: node.clone(),
                voter: voters.contains(id),
            })
            .collect()
    }

    async fn add_voter(
        &self,
        id: NodeId,
        node: ClusterNode,
        timeout: Duration,
    ) -> Result<(), ConsensusError> {
        let already_learner = self
            .configuration()
            .iter()
            .any(|m| m.id == id && m.node == node && !m.voter);
        let change = async {
            if !already_learner {
                self.raft
                    .add_learner(id, node.clone(), true)
                    .await
                    .map_err(write_error)?;
                info!(id, %node, "learner caught up");
            }

            self.raft
                .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
                .await
                .map_err(write_error)?;
            info!(id, "promoted to voter");
            Ok::<(), ConsensusError>(())
        };
        tokio::time::timeout(timeout, change)
            .await
            .map_err(|_| ConsensusError::Timeout(timeout))?
    }

    async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<(), ConsensusError> {
        let change = if self.is_voter(id) {
            ChangeMembers::RemoveVoters(BTreeSet::from([id]))
        } else {
            ChangeMembers::RemoveNodes(BTreeSet::from([id]))
        };

        tokio::time::timeout(timeout, self.raft.change_membership(change, false))
            .await
            .map_err(|_| ConsensusError::Timeout(timeout))?
            .map_err(write_error)?;
        info!(id, "removed from membership");
        Ok(())
    }

    fn stats(&self) -> ConsensusStats {
        let metrics = self.raft.metrics().borrow().clone();
        let membership = metrics.membership_config.membership();
        let voters = membership.voter_ids().count();
        let nodes = membership.nodes().count();

        ConsensusStats {
            node_id: metrics.id,
            state: format!("{:?}", metrics.state),
            term: metrics.current_term,
            leader_id: metrics.current_leader,
            last_log_index: metrics.last_log_index,
            last_applied: metrics.last_applied.map(|l| l.index),
            snapshot_index: metrics.snapshot.map(|l| l.index),
            purged_index: metrics.purged.map(|l| l.index),
            voters,
            learners: nodes.saturating_sub(voters),
        }
    }

    async fn shutdown(&self) -> Result<(), ConsensusError> {
        self.raft.shutdown().await.map_err(|e| {
            warn!(error = %e, "raft shutdown failed");
            ConsensusError::Other(e.to_string())
        })
    }
}
