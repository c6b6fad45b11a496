//! Cluster member records.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Addresses of one cluster member, stored in the Raft membership config.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Address serving the Raft RPC endpoints.
    pub raft_addr: String,
    /// Address serving the client HTTP API.
    pub client_addr: String,
}

impl ClusterNode {
    pub fn new(raft_addr: impl Into<String>, client_addr: impl Into<String>) -> Self {
        Self {
            raft_addr: raft_addr.into(),
            client_addr: client_addr.into(),
        }
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (client {})", self.raft_addr, self.client_addr)
    }
}

/// Error parsing a [`MemberIdentity`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("member identity must be \"<id>|<client address>\", got {0:?}")]
    Malformed(String),

    #[error("member id must be a number, got {0:?}")]
    InvalidId(String),
}

/// The `"<id>|<client address>"` identity a joining node announces.
///
/// This compound form only appears on the join request; inside the cluster
/// the two halves live in [`NodeId`] and [`ClusterNode::client_addr`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberIdentity {
    pub node_id: NodeId,
    pub client_addr: String,
}

impl MemberIdentity {
    pub fn new(node_id: NodeId, client_addr: impl Into<String>) -> Self {
        Self {
            node_id,
            client_addr: client_addr.into(),
        }
    }

    /// Combine with a Raft address into the member record.
    pub fn into_node(self, raft_addr: impl Into<String>) -> (NodeId, ClusterNode) {
        (
            self.node_id,
            ClusterNode::new(raft_addr, self.client_addr),
        )
    }
}

impl FromStr for MemberIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('|');
        let (Some(id), Some(addr), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(IdentityError::Malformed(s.to_string()));
        };
        if id.is_empty() || addr.is_empty() {
            return Err(IdentityError::Malformed(s.to_string()));
        }
        let node_id = id
            .parse::<NodeId>()
            .map_err(|_| IdentityError::InvalidId(id.to_string()))?;
        Ok(Self::new(node_id, addr))
    }
}

impl fmt::Display for MemberIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.node_id, self.client_addr)
    }
}
