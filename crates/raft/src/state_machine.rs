//! The contract between the Raft storage layer and the application state.
//!
//! [`PersistentRaftStore`](crate::PersistentRaftStore) owns log bookkeeping,
//! snapshot files and membership. Everything application-specific goes
//! through these traits:
//!
//! - [`StateMachine::apply`] runs one committed payload.
//! - [`StateMachine::snapshot`] captures the full state as a
//!   [`StateMachineSnapshot`], which is then written into a [`SnapshotSink`].
//! - [`StateMachine::restore`] replaces the full state from a snapshot stream.
//!
//! The storage layer calls these one at a time, never concurrently.

use crate::ApplyResponse;
use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors raised by a state machine.
#[derive(Error, Debug)]
pub enum StateMachineError {
    /// A committed entry could not be decoded. The node cannot continue.
    #[error("corrupt log entry: {0}")]
    Corrupt(String),

    /// Capturing or writing a snapshot failed.
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    /// Replacing state from a snapshot failed.
    #[error("restore failed: {0}")]
    Restore(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Application state driven by the Raft log.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed payload.
    ///
    /// Statement-level failures are reported as [`ApplyResponse::Failed`].
    /// Returning an error stops the Raft node.
    async fn apply(&self, payload: &[u8]) -> Result<ApplyResponse, StateMachineError>;

    /// Capture the full current state.
    async fn snapshot(&self) -> Result<Box<dyn StateMachineSnapshot>, StateMachineError>;

    /// Replace the full current state with the snapshot read from `data`.
    async fn restore(
        &self,
        data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<(), StateMachineError>;
}

/// A captured state, ready to be written out.
#[async_trait]
pub trait StateMachineSnapshot: Send + Sync {
    /// Write the snapshot into `sink`, then close it. On failure the sink is
    /// cancelled instead.
    async fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), StateMachineError>;

    /// Drop any resources held by the snapshot. Safe to call more than once.
    async fn release(&self);
}

/// Durable destination for a snapshot stream.
#[async_trait]
pub trait SnapshotSink: AsyncWrite + Send + Unpin {
    /// Identifier of the snapshot being written.
    fn id(&self) -> &str;

    /// Make the written snapshot durable and visible.
    async fn close(&mut self) -> io::Result<()>;

    /// Discard everything written so far.
    async fn cancel(&mut self) -> io::Result<()>;
}
