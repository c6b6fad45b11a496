//! Replicated SQL store.
//!
//! Every write is a [`Command`] carried through the Raft log and applied by
//! [`SqlStateMachine`] on every replica, in log order. Reads are served by
//! the local engine of whichever node receives them.
//!
//! ```rust,ignore
//! use raft::NodeConfig;
//! use store::Store;
//!
//! let config = NodeConfig::new(1, "./node1".into())
//!     .with_raft_addr("127.0.0.1:9302")
//!     .with_client_addr("127.0.0.1:9301");
//! let store = Store::open("./node1", config).await?;
//! store.bootstrap().await?;
//! store.execute("CREATE TABLE t (id INTEGER)").await?;
//! ```
//!
//! # Modules
//!
//! - [`command`]: log payload encoding of write commands
//! - [`snapshot`]: tar codec for full-state snapshots
//! - [`fsm`]: the replicated state machine
//! - [`coordinator`]: writes, reads, joins and stats against consensus
//! - [`store`]: the owning handle for one node

pub mod command;
pub mod coordinator;
mod error;
pub mod fsm;
pub mod snapshot;
pub mod store;

pub use command::{Command, CommandError};
pub use coordinator::{Coordinator, StorageStats, StoreStats};
pub use error::{Result, StoreError};
pub use fsm::SqlStateMachine;
pub use store::Store;

pub use engine::{ExecuteResult, QueryResult};
pub use raft::{ClusterNode, MemberIdentity, NodeConfig, NodeId};
