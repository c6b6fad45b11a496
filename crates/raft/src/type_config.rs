//! OpenRaft type configuration.

use crate::{ApplyResponse, ClusterNode, LogPayload, NodeId};
use std::io::Cursor;

openraft::declare_raft_types!(
    /// Raft type configuration for the replicated store.
    pub TypeConfig:
        D = LogPayload,
        R = ApplyResponse,
        NodeId = NodeId,
        Node = ClusterNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

pub type Entry = openraft::Entry<TypeConfig>;

pub type LogId = openraft::LogId<NodeId>;

pub type Vote = openraft::Vote<NodeId>;

pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, ClusterNode>;

pub type Membership = openraft::Membership<NodeId, ClusterNode>;

pub type StoredMembership = openraft::StoredMembership<NodeId, ClusterNode>;
