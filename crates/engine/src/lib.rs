//! Storage engine adapter for the replicated store.
//!
//! The replicated state machine treats the local database as an opaque
//! capability: it can execute a statement, run a query, and move the whole
//! database in and out of a directory. [`StorageEngine`] captures exactly that
//! surface so the state machine and the coordinator never see the concrete
//! engine.
//!
//! [`SqliteEngine`] is the production implementation on top of an embedded
//! SQLite database. All SQLite calls run on the blocking thread pool.
//!
//! ```rust,ignore
//! use engine::{SqliteEngine, StorageEngine};
//!
//! let engine = SqliteEngine::open("./data/sqlite").await?;
//! engine.execute("CREATE TABLE t (id INTEGER)").await?;
//! let rows = engine.query("SELECT * FROM t").await?;
//! ```

mod error;
mod sqlite;

pub use error::{EngineError, Result};
pub use sqlite::{SqliteEngine, DATABASE_FILE, EXPORT_FILE};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Outcome of a statement that modifies the database.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub rows_affected: u64,
}

/// Rows returned by a read-only statement.
///
/// `values` holds one JSON value per column for each row. Empty vectors are
/// omitted from the serialized form.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Vec<serde_json::Value>>,
}

impl QueryResult {
    /// Number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.values.len()
    }
}

/// The capability the replicated store needs from a local database.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Execute statements that change the database.
    ///
    /// `sql` may hold several `;`-separated statements; they run in order and
    /// their affected row counts are summed. Rows a statement yields are
    /// discarded.
    async fn execute(&self, sql: &str) -> Result<ExecuteResult>;

    /// Run a read-only statement and collect its rows.
    async fn query(&self, sql: &str) -> Result<QueryResult>;

    /// Dump the complete database state into `dir`.
    ///
    /// `dir` must exist. The layout of its contents is engine-specific and is
    /// only ever consumed by [`StorageEngine::import`] of the same engine.
    async fn export(&self, dir: &Path) -> Result<()>;

    /// Replace the complete database state with the export found in `dir`.
    async fn import(&self, dir: &Path) -> Result<()>;

    /// Close the database. Later calls fail with [`EngineError::Closed`].
    /// Closing twice is not an error.
    async fn close(&self) -> Result<()>;

    /// Directory holding the live database files.
    fn path(&self) -> &Path;
}
