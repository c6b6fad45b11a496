//! SQLite implementation of [`StorageEngine`].

use crate::{EngineError, ExecuteResult, QueryResult, Result, StorageEngine};
use async_trait::async_trait;
use rusqlite::backup::Progress;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, DatabaseName};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Name of the live database file inside the engine directory.
pub const DATABASE_FILE: &str = "database.db";

/// Name of the database copy written by [`StorageEngine::export`].
pub const EXPORT_FILE: &str = "export.db";

/// Embedded SQLite database behind a single connection.
///
/// The connection lives behind an async mutex and is only touched from
/// `spawn_blocking` tasks, so statements never block the runtime.
pub struct SqliteEngine {
    dir: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteEngine {
    /// Open (or create) the database in `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let dir_owned = dir.clone();

        let conn = tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir_owned)?;
            let path = dir_owned.join(DATABASE_FILE);
            info!(path = %path.display(), "opening database");
            let conn = Connection::open(&path)?;
            Ok::<_, EngineError>(conn)
        })
        .await??;

        Ok(Self {
            dir,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` against the open connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            let conn = guard.as_mut().ok_or(EngineError::Closed)?;
            f(conn)
        })
        .await?
    }
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    async fn execute(&self, sql: &str) -> Result<ExecuteResult> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            debug!(%sql, "executing statement");
            let mut rows_affected = 0u64;
            let mut batch = Batch::new(conn, &sql);
            while let Some(mut stmt) = batch.next()? {
                if stmt.column_count() > 0 {
                    // Run to completion; the rows themselves are discarded.
                    let mut rows = stmt.raw_query();
                    while rows.next()?.is_some() {}
                } else {
                    rows_affected += stmt.execute(())? as u64;
                }
            }
            debug!(rows_affected, "statement executed");
            Ok(ExecuteResult { rows_affected })
        })
        .await
    }

    async fn query(&self, sql: &str) -> Result<QueryResult> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            debug!(%sql, "running query");
            let mut stmt = conn.prepare(&sql)?;

            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            let declared: Vec<Option<String>> = stmt
                .columns()
                .iter()
                .map(|col| col.decl_type().map(str::to_string))
                .collect();

            let width = columns.len();
            let mut values = Vec::new();
            let mut first_row_types: Option<Vec<&'static str>> = None;

            let mut rows = stmt.query(())?;
            while let Some(row) = rows.next()? {
                let mut out = Vec::with_capacity(width);
                let mut row_types = Vec::with_capacity(width);
                for i in 0..width {
                    let value = row.get_ref(i)?;
                    row_types.push(runtime_type(value));
                    out.push(to_json(value));
                }
                first_row_types.get_or_insert(row_types);
                values.push(out);
            }

            // Expressions have no declared type; fall back to what the first
            // row actually held.
            let types = declared
                .into_iter()
                .enumerate()
                .map(|(i, decl)| {
                    decl.unwrap_or_else(|| {
                        first_row_types
                            .as_ref()
                            .and_then(|t| t.get(i))
                            .copied()
                            .unwrap_or("NULL")
                            .to_string()
                    })
                })
                .collect();

            debug!(rows = values.len(), "query finished");
            Ok(QueryResult {
                columns,
                types,
                values,
            })
        })
        .await
    }

    async fn export(&self, dir: &Path) -> Result<()> {
        let target = dir.join(EXPORT_FILE);
        self.with_connection(move |conn| {
            // VACUUM INTO refuses to overwrite an existing file.
            if target.exists() {
                fs::remove_file(&target)?;
            }
            let target_str = target.to_string_lossy().into_owned();
            conn.execute("VACUUM INTO ?1", [target_str.as_str()])?;
            info!(path = %target.display(), "exported database");
            Ok(())
        })
        .await
    }

    async fn import(&self, dir: &Path) -> Result<()> {
        let source = dir.join(EXPORT_FILE);
        self.with_connection(move |conn| {
            if !source.is_file() {
                return Err(EngineError::MissingExport(source));
            }
            conn.restore(DatabaseName::Main, &source, None::<fn(Progress)>)?;
            info!(path = %source.display(), "imported database");
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let Some(conn) = conn.blocking_lock().take() else {
                return Ok(());
            };
            info!("closing database");
            conn.close().map_err(|(_, e)| EngineError::from(e))
        })
        .await?
    }

    fn path(&self) -> &Path {
        &self.dir
    }
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        // Blobs are arbitrary bytes; an array of byte values keeps them intact.
        ValueRef::Blob(bytes) => serde_json::Value::from(bytes.to_vec()),
    }
}

fn runtime_type(value: ValueRef<'_>) -> &'static str {
    match value {
        ValueRef::Null => "NULL",
        ValueRef::Integer(_) => "INTEGER",
        ValueRef::Real(_) => "REAL",
        ValueRef::Text(_) => "TEXT",
        ValueRef::Blob(_) => "BLOB",
    }
}
