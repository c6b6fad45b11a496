//! Write commands as they travel through the Raft log.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to turn log bytes back into a [`Command`].
#[derive(Error, Debug)]
#[error("invalid command encoding: {0}")]
pub struct CommandError(#[from] serde_json::Error);

/// A single SQL statement to apply on every replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub sql: String,
}

impl Command {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// Encode as the log entry payload, `{"sql": "..."}`.
    pub fn encode(&self) -> Result<Vec<u8>, CommandError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
