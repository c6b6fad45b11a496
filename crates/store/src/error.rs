//! Error types for the replicated store.

use crate::command::CommandError;
use raft::{ConsensusError, StartError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Writes must go to the leader. Carries its client address when known.
    #[error("not leader")]
    NotLeader { leader: Option<String> },

    /// The statement failed inside the engine.
    #[error("{0}")]
    Execution(String),

    /// The write was not applied in time. It may still commit.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("membership change failed: {0}")]
    Membership(String),

    /// The consensus node has stopped for good.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_leader(&self) -> bool {
        matches!(self, StoreError::NotLeader { .. })
    }

    /// Client address of the leader, if this is a [`StoreError::NotLeader`]
    /// that knows it.
    pub fn leader(&self) -> Option<&str> {
        match self {
            StoreError::NotLeader { leader } => leader.as_deref(),
            _ => None,
        }
    }
}

impl From<ConsensusError> for StoreError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader { leader } => StoreError::NotLeader {
                leader: leader.map(|node| node.client_addr),
            },
            ConsensusError::Timeout(d) => StoreError::Timeout(d),
            ConsensusError::Membership(msg) => StoreError::Membership(msg),
            ConsensusError::Fatal(msg) => StoreError::Fatal(msg),
            ConsensusError::Other(msg) => StoreError::Consensus(msg),
        }
    }
}

impl From<StartError> for StoreError {
    fn from(err: StartError) -> Self {
        match err {
            StartError::Storage(e) => StoreError::Io(e),
            other => StoreError::Consensus(other.to_string()),
        }
    }
}

impl From<CommandError> for StoreError {
    fn from(err: CommandError) -> Self {
        StoreError::Execution(err.to_string())
    }
}
