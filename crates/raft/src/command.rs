//! Raft log payload and apply response types.
//!
//! The log carries opaque bytes. Encoding statements into those bytes is the
//! job of the layer above; the consensus crate only moves them around and
//! hands them to the [`StateMachine`](crate::StateMachine) in log order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Application payload of a normal log entry.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload(pub Vec<u8>);

impl LogPayload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for LogPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogPayload({} bytes)", self.0.len())
    }
}

/// Result of applying one log entry to the state machine.
///
/// Returned to the client that proposed the entry (leader side only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResponse {
    /// The statement ran against the local database.
    Executed { rows_affected: u64 },

    /// The statement was rejected by the database. The entry still counts as
    /// applied; every replica observes the same failure.
    Failed { message: String },

    /// Blank or membership entry with nothing to apply.
    Skipped,
}

impl ApplyResponse {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}
