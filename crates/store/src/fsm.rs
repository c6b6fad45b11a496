//! The replicated state machine: committed SQL applied to the local engine.

use crate::command::Command;
use crate::snapshot::{self, ExportedSnapshot, RESTORE_DIR_PREFIX, SNAPSHOT_DIR_PREFIX};
use async_trait::async_trait;
use engine::StorageEngine;
use raft::{ApplyResponse, StateMachine, StateMachineError, StateMachineSnapshot};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Applies committed [`Command`]s to a [`StorageEngine`].
///
/// `apply`, `snapshot` and `restore` take a single lock, so a snapshot never
/// observes a half-applied entry even if the Raft layer calls them from
/// different tasks.
pub struct SqlStateMachine {
    engine: Arc<dyn StorageEngine>,
    lock: Mutex<()>,
}

impl SqlStateMachine {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl StateMachine for SqlStateMachine {
    async fn apply(&self, payload: &[u8]) -> Result<ApplyResponse, StateMachineError> {
        let _guard = self.lock.lock().await;

        let command = Command::decode(payload).map_err(|e| {
            error!(error = %e, bytes = payload.len(), "failed to decode committed entry");
            StateMachineError::Corrupt(e.to_string())
        })?;

        match self.engine.execute(&command.sql).await {
            Ok(result) => Ok(ApplyResponse::Executed {
                rows_affected: result.rows_affected,
            }),
            Err(e) => {
                // The entry is still applied; every replica sees the same failure.
                debug!(sql = %command.sql, error = %e, "statement failed");
                Ok(ApplyResponse::Failed {
                    message: e.to_string(),
                })
            }
        }
    }

    async fn snapshot(&self) -> Result<Box<dyn StateMachineSnapshot>, StateMachineError> {
        let _guard = self.lock.lock().await;

        let dir = tempfile::Builder::new()
            .prefix(SNAPSHOT_DIR_PREFIX)
            .tempdir()?;
        self.engine
            .export(dir.path())
            .await
            .map_err(|e| StateMachineError::Snapshot(e.to_string()))?;

        info!(path = %dir.path().display(), "exported state for snapshot");
        Ok(Box::new(ExportedSnapshot::new(dir)))
    }

    async fn restore(
        &self,
        data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<(), StateMachineError> {
        let _guard = self.lock.lock().await;

        let staging = tempfile::Builder::new()
            .prefix(RESTORE_DIR_PREFIX)
            .tempdir()?;

        let result = async {
            snapshot::unpack(data, staging.path())
                .await
                .map_err(|e| StateMachineError::Restore(e.to_string()))?;
            self.engine
                .import(staging.path())
                .await
                .map_err(|e| StateMachineError::Restore(e.to_string()))
        }
        .await;

        let staging_path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            debug!(path = %staging_path.display(), error = %e, "failed to remove restore staging");
        }

        match &result {
            Ok(()) => info!("restored state from snapshot"),
            Err(e) => error!(error = %e, "snapshot restore failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::SqliteEngine;
    use raft::SnapshotSink;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::AsyncWrite;

    #[derive(Default)]
    struct BufferSink(Vec<u8>);

    impl AsyncWrite for BufferSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl SnapshotSink for BufferSink {
        fn id(&self) -> &str {
            "test"
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn cancel(&mut self) -> io::Result<()> {
            self.0.clear();
            Ok(())
        }
    }

    async fn machine(dir: &TempDir) -> (SqlStateMachine, Arc<SqliteEngine>) {
        let engine = Arc::new(SqliteEngine::open(dir.path()).await.unwrap());
        (SqlStateMachine::new(engine.clone()), engine)
    }

    fn payload(sql: &str) -> Vec<u8> {
        Command::new(sql).encode().unwrap()
    }

    #[tokio::test]
    async fn apply_executes_statement() {
        let dir = TempDir::new().unwrap();
        let (fsm, engine) = machine(&dir).await;

        fsm.apply(&payload("CREATE TABLE t (id INTEGER)"))
            .await
            .unwrap();
        let response = fsm
            .apply(&payload("INSERT INTO t VALUES (1), (2)"))
            .await
            .unwrap();
        assert_eq!(response, ApplyResponse::Executed { rows_affected: 2 });

        let rows = engine.query("SELECT id FROM t").await.unwrap();
        assert_eq!(rows.row_count(), 2);
    }

    #[tokio::test]
    async fn engine_error_is_applied_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (fsm, _engine) = machine(&dir).await;

        let response = fsm.apply(&payload("INSERT INTO missing VALUES (1)")).await;
        match response.unwrap() {
            ApplyResponse::Failed { message } => assert!(message.contains("missing")),
            other => panic!("expected failure, got {:?}", other),
        }

        let next = fsm.apply(&payload("CREATE TABLE t (id INTEGER)")).await;
        assert!(matches!(next, Ok(ApplyResponse::Executed { .. })));
    }

    #[tokio::test]
    async fn undecodable_entry_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let (fsm, _engine) = machine(&dir).await;

        let result = fsm.apply(b"not json").await;
        assert!(matches!(result, Err(StateMachineError::Corrupt(_))));
    }

    #[tokio::test]
    async fn snapshot_restores_into_fresh_engine() {
        let source_dir = TempDir::new().unwrap();
        let (source, _) = machine(&source_dir).await;
        source
            .apply(&payload("CREATE TABLE t (id INTEGER, name TEXT)"))
            .await
            .unwrap();
        source
            .apply(&payload("INSERT INTO t VALUES (1, 'a'), (2, 'b')"))
            .await
            .unwrap();

        let snap = source.snapshot().await.unwrap();
        let mut sink = BufferSink::default();
        snap.persist(&mut sink).await.unwrap();
        snap.release().await;

        let target_dir = TempDir::new().unwrap();
        let (target, target_engine) = machine(&target_dir).await;
        target
            .apply(&payload("CREATE TABLE stale (x INTEGER)"))
            .await
            .unwrap();

        target.restore(Box::new(io::Cursor::new(sink.0))).await.unwrap();

        let rows = target_engine
            .query("SELECT name FROM t ORDER BY id")
            .await
            .unwrap();
        assert_eq!(
            rows.values,
            vec![vec![serde_json::json!("a")], vec![serde_json::json!("b")]]
        );
        assert!(target_engine.query("SELECT * FROM stale").await.is_err());
    }

    #[tokio::test]
    async fn restore_of_garbage_fails() {
        let dir = TempDir::new().unwrap();
        let (fsm, _engine) = machine(&dir).await;

        let result = fsm
            .restore(Box::new(io::Cursor::new(vec![7u8; 1024])))
            .await;
        assert!(matches!(result, Err(StateMachineError::Restore(_))));
    }
}
