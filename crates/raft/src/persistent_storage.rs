//! Persistent Raft storage implementation.
//!
//! This module provides durable Raft log, vote and snapshot storage that
//! survives restarts. Application state is delegated to a [`StateMachine`].
//!
//! ## File Layout
//!
//! ```text
//! {data_dir}/
//! ├── raft.log           # Append-only log entries
//! ├── raft_state.json    # Vote, committed, purge point, snapshot counter
//! └── snapshots/         # State machine snapshots
//!     └── {term}_{index}_{seq}.snap
//! ```
//!
//! ## Log File Format
//!
//! Each entry in `raft.log` has a fixed header followed by a variable-length payload:
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (28 bytes)                  │
//! │ ├─ magic: u32 (0x52414654 "RAFT") │
//! │ ├─ checksum: u32 (CRC32)          │
//! │ ├─ length: u32                     │
//! │ ├─ index: u64                      │
//! │ └─ term: u64                       │
//! ├────────────────────────────────────┤
//! │ Payload (bincode Entry)            │
//! └────────────────────────────────────┘
//! ```
//!
//! ## Recovery
//!
//! The state machine's progress is not persisted. On open the newest
//! snapshot is restored into the state machine and `last_applied` is set to
//! the snapshot's log id; OpenRaft then re-applies the committed entries that
//! follow it.

use crate::snapshot_store::SnapshotStore;
use crate::state_machine::{SnapshotSink, StateMachine};
use crate::type_config::{Entry, LogId, SnapshotMeta, StoredMembership, TypeConfig, Vote};
use crate::{ApplyResponse, NodeConfig, NodeId};

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{EntryPayload, OptionalSend, RaftStorage, RaftTypeConfig, StorageError, StorageIOError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Magic bytes for log entry validation: "RAFT" in ASCII
const RAFT_MAGIC: u32 = 0x52414654;

/// Size of the log entry header in bytes
const HEADER_SIZE: usize = 28;

const LOG_FILE: &str = "raft.log";
const STATE_FILE: &str = "raft_state.json";

/// Persistent state stored in `raft_state.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RaftState {
    /// Current vote (term and candidate voted for)
    vote: Option<Vote>,
    /// Committed log ID
    committed: Option<LogId>,
    /// Last purged log ID (entries up to this are compacted)
    last_purged_log_id: Option<LogId>,
    /// Snapshot counter for unique IDs
    snapshot_idx: u64,
}

/// Progress of the state machine. Lives in memory only.
#[derive(Clone, Debug, Default)]
struct StateMachineMeta {
    last_applied_log: Option<LogId>,
    last_membership: StoredMembership,
}

/// The most recent snapshot, kept in memory for followers that need it.
#[derive(Clone, Debug)]
struct StoredSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

/// Header for each log entry in `raft.log`.
#[derive(Clone, Debug)]
struct LogEntryHeader {
    magic: u32,
    /// CRC32 checksum of the payload
    checksum: u32,
    /// Payload length in bytes
    length: u32,
    index: u64,
    term: u64,
}

impl LogEntryHeader {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..20].copy_from_slice(&self.index.to_le_bytes());
        buf[20..28].copy_from_slice(&self.term.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        Self {
            magic: u32_at(0),
            checksum: u32_at(4),
            length: u32_at(8),
            index: u64_at(12),
            term: u64_at(20),
        }
    }
}

/// Serialize an entry into its on-disk record (header + payload).
fn encode_entry(entry: &Entry) -> io::Result<Vec<u8>> {
    let config = bincode::config::legacy();
    let payload = bincode::serde::encode_to_vec(entry, config).map_err(io::Error::other)?;

    let header = LogEntryHeader {
        magic: RAFT_MAGIC,
        checksum: crc32fast::hash(&payload),
        length: payload.len() as u32,
        index: entry.log_id.index,
        term: entry.log_id.leader_id.term,
    };

    let mut record = Vec::with_capacity(HEADER_SIZE + payload.len());
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Persistent Raft storage that survives restarts.
///
/// This implementation persists:
/// - Log entries to `raft.log` (append-only with checksums)
/// - Vote, committed and purge state to `raft_state.json` (atomic updates)
/// - Snapshots to `snapshots/` through a [`SnapshotStore`]
pub struct PersistentRaftStore {
    /// Directory containing all Raft files
    data_dir: PathBuf,

    /// Log entries after the purge point, keyed by index
    log_cache: RwLock<BTreeMap<u64, Entry>>,

    last_purged_log_id: RwLock<Option<LogId>>,

    vote: RwLock<Option<Vote>>,

    committed: RwLock<Option<LogId>>,

    /// Snapshot counter for unique IDs
    snapshot_idx: RwLock<u64>,

    /// State machine progress; held for the whole of every state machine call
    sm: RwLock<StateMachineMeta>,

    current_snapshot: RwLock<Option<StoredSnapshot>>,

    snapshots: SnapshotStore,

    fsm: Arc<dyn StateMachine>,
}

impl PersistentRaftStore {
    /// Open or create persistent storage at the given directory.
    ///
    /// On startup:
    /// 1. Creates directories if needed
    /// 2. Loads state from `raft_state.json`
    /// 3. Rebuilds the in-memory log by scanning `raft.log`
    /// 4. Restores the newest snapshot into `fsm`
    pub async fn open(
        data_dir: impl AsRef<Path>,
        retain_snapshots: usize,
        fsm: Arc<dyn StateMachine>,
    ) -> io::Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        let snapshots = SnapshotStore::open(data_dir.join("snapshots"), retain_snapshots)?;

        let state_path = data_dir.join(STATE_FILE);
        let state: RaftState = if state_path.exists() {
            let contents = fs::read_to_string(&state_path)?;
            serde_json::from_str(&contents)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        } else {
            RaftState::default()
        };

        let log_cache = Self::rebuild_log(&data_dir.join(LOG_FILE), state.last_purged_log_id)?;

        let mut sm = StateMachineMeta::default();
        let mut current_snapshot = None;
        if let Some(latest) = snapshots.latest()? {
            let (meta, data) = SnapshotStore::read(&latest.path).await?;
            info!(id = %meta.snapshot_id, "restoring state machine from snapshot");
            fsm.restore(Box::new(Cursor::new(data.clone())))
                .await
                .map_err(io::Error::other)?;
            sm.last_applied_log = meta.last_log_id;
            sm.last_membership = meta.last_membership.clone();
            current_snapshot = Some(StoredSnapshot { meta, data });
        }

        let snapshot_idx = state.snapshot_idx.max(snapshots.max_seq()?);

        info!(
            dir = %data_dir.display(),
            entries = log_cache.len(),
            last_applied = ?sm.last_applied_log,
            "opened raft storage"
        );

        Ok(Self {
            data_dir,
            log_cache: RwLock::new(log_cache),
            last_purged_log_id: RwLock::new(state.last_purged_log_id),
            vote: RwLock::new(state.vote),
            committed: RwLock::new(state.committed),
            snapshot_idx: RwLock::new(snapshot_idx),
            sm: RwLock::new(sm),
            current_snapshot: RwLock::new(current_snapshot),
            snapshots,
            fsm,
        })
    }

    /// Rebuild the log by scanning the log file.
    ///
    /// Scanning stops at the first torn or corrupt record. A record whose
    /// index is not past the previous one starts a new tail, replacing the
    /// entries it conflicts with.
    fn rebuild_log(
        log_path: &Path,
        last_purged: Option<LogId>,
    ) -> io::Result<BTreeMap<u64, Entry>> {
        let mut cache = BTreeMap::new();

        if !log_path.exists() {
            return Ok(cache);
        }

        let mut reader = BufReader::new(File::open(log_path)?);
        let purged_index = last_purged.map(|lid| lid.index);

        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            match reader.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let header = LogEntryHeader::from_bytes(&header_buf);
            if header.magic != RAFT_MAGIC {
                warn!(path = %log_path.display(), "bad magic in raft log, ignoring tail");
                break;
            }

            let mut payload = vec![0u8; header.length as usize];
            if reader.read_exact(&mut payload).is_err() {
                warn!(index = header.index, "torn raft log record, ignoring tail");
                break;
            }

            if crc32fast::hash(&payload) != header.checksum {
                warn!(index = header.index, "checksum mismatch in raft log, ignoring tail");
                break;
            }

            if purged_index.is_some_and(|purged| header.index <= purged) {
                continue;
            }

            let config = bincode::config::legacy();
            let entry = match bincode::serde::decode_from_slice::<Entry, _>(&payload, config) {
                Ok((entry, _)) => entry,
                Err(e) => {
                    warn!(index = header.index, error = %e, "undecodable raft log record, ignoring tail");
                    break;
                }
            };

            let _ = cache.split_off(&header.index);
            cache.insert(header.index, entry);
        }

        Ok(cache)
    }

    /// Save the current state to `raft_state.json` atomically.
    fn save_state(&self, state: &RaftState) -> io::Result<()> {
        let state_path = self.data_dir.join(STATE_FILE);
        let temp_path = self.data_dir.join("raft_state.json.tmp");

        let contents = serde_json::to_string_pretty(state).map_err(io::Error::other)?;
        fs::write(&temp_path, &contents)?;
        File::open(&temp_path)?.sync_all()?;

        fs::rename(&temp_path, &state_path)?;
        sync_dir(&self.data_dir)
    }

    /// Append entries to the log file and fsync once.
    fn append_entries_to_file(&self, entries: &[Entry]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(LOG_FILE))?;

        {
            let mut writer = BufWriter::new(&mut file);
            for entry in entries {
                writer.write_all(&encode_entry(entry)?)?;
            }
            writer.flush()?;
        }

        file.sync_all()
    }

    /// Replace the log file with exactly the given entries.
    fn rewrite_log_file(&self, cache: &BTreeMap<u64, Entry>) -> io::Result<()> {
        let log_path = self.data_dir.join(LOG_FILE);
        let temp_path = self.data_dir.join("raft.log.tmp");

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        for entry in cache.values() {
            writer.write_all(&encode_entry(entry)?)?;
        }
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        fs::rename(&temp_path, &log_path)?;
        sync_dir(&self.data_dir)
    }

    async fn get_current_state(&self) -> RaftState {
        RaftState {
            vote: *self.vote.read().await,
            committed: *self.committed.read().await,
            last_purged_log_id: *self.last_purged_log_id.read().await,
            snapshot_idx: *self.snapshot_idx.read().await,
        }
    }

    async fn persist_state(&self) -> io::Result<()> {
        let state = self.get_current_state().await;
        self.save_state(&state)
    }

    /// Record a freshly written snapshot: prune old files and keep it in memory.
    async fn remember_snapshot(&self, meta: SnapshotMeta, data: Vec<u8>) -> io::Result<()> {
        let pruned = self.snapshots.prune()?;
        if pruned > 0 {
            debug!(pruned, "pruned old snapshots");
        }
        self.persist_state().await?;
        *self.current_snapshot.write().await = Some(StoredSnapshot { meta, data });
        Ok(())
    }

    /// Last log id applied to the state machine.
    pub async fn last_applied(&self) -> Option<LogId> {
        self.sm.read().await.last_applied_log
    }

    /// Directory holding the snapshot files.
    pub fn snapshot_dir(&self) -> &Path {
        self.snapshots.dir()
    }
}

/// Type alias for the persistent store wrapped in Arc.
pub type PersistentLogStore = Arc<PersistentRaftStore>;

/// Open the persistent store described by `config`, driving `fsm`.
pub async fn create_persistent_storage(
    config: &NodeConfig,
    fsm: Arc<dyn StateMachine>,
) -> io::Result<PersistentLogStore> {
    let store = PersistentRaftStore::open(&config.data_dir, config.retain_snapshots, fsm).await?;
    Ok(Arc::new(store))
}

impl RaftLogReader<TypeConfig> for Arc<PersistentRaftStore> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, StorageError<NodeId>> {
        let cache = self.log_cache.read().await;
        Ok(cache.range(range).map(|(_, e)| e.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<PersistentRaftStore> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        // Hold the state machine lock so no entry is applied while capturing.
        let sm = self.sm.write().await;
        let last_applied_log = sm.last_applied_log;
        let last_membership = sm.last_membership.clone();

        let snapshot_idx = {
            let mut idx = self.snapshot_idx.write().await;
            *idx += 1;
            *idx
        };

        let snapshot_id = match last_applied_log {
            Some(last) => format!("{}_{}_{}", last.leader_id.term, last.index, snapshot_idx),
            None => format!("0_0_{}", snapshot_idx),
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied_log,
            last_membership,
            snapshot_id,
        };
        let signature = meta.signature();

        let captured = self
            .fsm
            .snapshot()
            .await
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let mut sink = match self.snapshots.create(&meta).await {
            Ok(sink) => sink,
            Err(e) => {
                captured.release().await;
                return Err(StorageIOError::write_snapshot(Some(signature), &e).into());
            }
        };
        let persisted = captured.persist(&mut sink).await;
        captured.release().await;
        persisted.map_err(|e| StorageIOError::write_snapshot(Some(signature.clone()), &e))?;
        drop(sm);

        let (_, data) = SnapshotStore::read(sink.path())
            .await
            .map_err(|e| StorageIOError::read_snapshot(Some(signature.clone()), &e))?;

        self.remember_snapshot(meta.clone(), data.clone())
            .await
            .map_err(|e| StorageIOError::write_snapshot(Some(signature), &e))?;

        info!(id = %meta.snapshot_id, bytes = data.len(), "built snapshot");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Arc<PersistentRaftStore> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let log_cache = self.log_cache.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log_cache
            .iter()
            .next_back()
            .map(|(_, e)| e.log_id)
            .or(last_purged);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), StorageError<NodeId>> {
        *self.vote.write().await = Some(*vote);
        self.persist_state()
            .await
            .map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, StorageError<NodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId>,
    ) -> Result<(), StorageError<NodeId>> {
        *self.committed.write().await = committed;
        self.persist_state()
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, StorageError<NodeId>> {
        Ok(*self.committed.read().await)
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId>, StoredMembership), StorageError<NodeId>> {
        let sm = self.sm.read().await;
        Ok((sm.last_applied_log, sm.last_membership.clone()))
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId,
    ) -> Result<(), StorageError<NodeId>> {
        let mut log_cache = self.log_cache.write().await;
        let removed = log_cache.split_off(&log_id.index);
        debug!(since = log_id.index, removed = removed.len(), "deleting conflicting logs");

        self.rewrite_log_file(&log_cache)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        *self.last_purged_log_id.write().await = Some(log_id);
        self.persist_state()
            .await
            .map_err(|e| StorageIOError::write_logs(&e))?;

        let mut log_cache = self.log_cache.write().await;
        *log_cache = log_cache.split_off(&(log_id.index + 1));
        debug!(upto = log_id.index, remaining = log_cache.len(), "purged logs");

        self.rewrite_log_file(&log_cache)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
    {
        let entries: Vec<Entry> = entries.into_iter().collect();
        let Some(last) = entries.last().map(|e| e.log_id) else {
            return Ok(());
        };

        let mut log_cache = self.log_cache.write().await;
        self.append_entries_to_file(&entries)
            .map_err(|e| StorageIOError::write_log_entry(last, &e))?;

        for entry in entries {
            log_cache.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry],
    ) -> Result<Vec<ApplyResponse>, StorageError<NodeId>> {
        let mut res = Vec::with_capacity(entries.len());
        let mut sm = self.sm.write().await;

        for entry in entries {
            match &entry.payload {
                EntryPayload::Blank => res.push(ApplyResponse::Skipped),
                EntryPayload::Normal(payload) => {
                    let response = self
                        .fsm
                        .apply(payload.as_bytes())
                        .await
                        .map_err(|e| StorageIOError::write_state_machine(&e))?;
                    res.push(response);
                }
                EntryPayload::Membership(mem) => {
                    sm.last_membership = StoredMembership::new(Some(entry.log_id), mem.clone());
                    res.push(ApplyResponse::Skipped);
                }
            }
            sm.last_applied_log = Some(entry.log_id);
        }

        Ok(res)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<<TypeConfig as RaftTypeConfig>::SnapshotData>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<<TypeConfig as RaftTypeConfig>::SnapshotData>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        let signature = meta.signature();
        let mut sm = self.sm.write().await;

        let mut sink = self
            .snapshots
            .create(meta)
            .await
            .map_err(|e| StorageIOError::write_snapshot(Some(signature.clone()), &e))?;
        let written = match sink.write_all(&data).await {
            Ok(()) => sink.close().await,
            Err(e) => {
                let _ = sink.cancel().await;
                Err(e)
            }
        };
        written.map_err(|e| StorageIOError::write_snapshot(Some(signature.clone()), &e))?;

        self.fsm
            .restore(Box::new(Cursor::new(data.clone())))
            .await
            .map_err(|e| StorageIOError::read_snapshot(Some(signature.clone()), &e))?;

        sm.last_applied_log = meta.last_log_id;
        sm.last_membership = meta.last_membership.clone();
        drop(sm);

        self.remember_snapshot(meta.clone(), data)
            .await
            .map_err(|e| StorageIOError::write_snapshot(Some(signature), &e))?;

        info!(id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let current_snapshot = self.current_snapshot.read().await;
        Ok(current_snapshot.as_ref().map(|snapshot| Snapshot {
            meta: snapshot.meta.clone(),
            snapshot: Box::new(Cursor::new(snapshot.data.clone())),
        }))
    }
}

impl Debug for PersistentRaftStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRaftStore")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{StateMachineError, StateMachineSnapshot};
    use crate::LogPayload;
    use async_trait::async_trait;
    use openraft::CommittedLeaderId;
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, AsyncReadExt};
    use tokio::sync::Mutex;

    /// Records every applied payload; snapshots are the JSON list.
    #[derive(Default)]
    struct RecordingMachine {
        applied: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingMachine {
        async fn applied(&self) -> Vec<Vec<u8>> {
            self.applied.lock().await.clone()
        }
    }

    struct RecordingSnapshot(Vec<u8>);

    #[async_trait]
    impl StateMachine for RecordingMachine {
        async fn apply(&self, payload: &[u8]) -> Result<ApplyResponse, StateMachineError> {
            if payload == b"corrupt" {
                return Err(StateMachineError::Corrupt("bad payload".into()));
            }
            let mut applied = self.applied.lock().await;
            applied.push(payload.to_vec());
            Ok(ApplyResponse::Executed {
                rows_affected: applied.len() as u64,
            })
        }

        async fn snapshot(&self) -> Result<Box<dyn StateMachineSnapshot>, StateMachineError> {
            let applied = self.applied.lock().await;
            let data = serde_json::to_vec(&*applied).map_err(|e| StateMachineError::Snapshot(e.to_string()))?;
            Ok(Box::new(RecordingSnapshot(data)))
        }

        async fn restore(
            &self,
            mut data: Box<dyn AsyncRead + Send + Unpin>,
        ) -> Result<(), StateMachineError> {
            let mut buf = Vec::new();
            data.read_to_end(&mut buf).await?;
            let restored: Vec<Vec<u8>> =
                serde_json::from_slice(&buf).map_err(|e| StateMachineError::Restore(e.to_string()))?;
            *self.applied.lock().await = restored;
            Ok(())
        }
    }

    #[async_trait]
    impl StateMachineSnapshot for RecordingSnapshot {
        async fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), StateMachineError> {
            if let Err(e) = sink.write_all(&self.0).await {
                sink.cancel().await?;
                return Err(e.into());
            }
            sink.close().await?;
            Ok(())
        }

        async fn release(&self) {}
    }

    fn log_id(term: u64, index: u64) -> LogId {
        LogId::new(CommittedLeaderId::new(term, 1), index)
    }

    fn make_entry(index: u64, term: u64, payload: &[u8]) -> Entry {
        Entry {
            log_id: log_id(term, index),
            payload: EntryPayload::Normal(LogPayload::new(payload.to_vec())),
        }
    }

    async fn open(dir: &Path) -> (Arc<PersistentRaftStore>, Arc<RecordingMachine>) {
        let fsm = Arc::new(RecordingMachine::default());
        let store = PersistentRaftStore::open(dir, 2, fsm.clone()).await.unwrap();
        (Arc::new(store), fsm)
    }

    #[tokio::test]
    async fn test_open_creates_directories() {
        let dir = TempDir::new().unwrap();
        let (store, _) = open(dir.path()).await;
        assert!(dir.path().join("snapshots").exists());
        assert_eq!(store.snapshot_dir(), dir.path().join("snapshots"));
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path()).await;

        store
            .append_to_log(vec![make_entry(1, 1, b"a"), make_entry(2, 1, b"b")])
            .await
            .unwrap();

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 2)));

        let entries = store.try_get_log_entries(2..=2).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id.index, 2);
    }

    #[tokio::test]
    async fn test_vote_persistence() {
        let dir = TempDir::new().unwrap();
        let vote = Vote::new(5, 1);

        {
            let (mut store, _) = open(dir.path()).await;
            store.save_vote(&vote).await.unwrap();
            store.save_committed(Some(log_id(5, 7))).await.unwrap();
        }

        let (mut store, _) = open(dir.path()).await;
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
        assert_eq!(store.read_committed().await.unwrap(), Some(log_id(5, 7)));
    }

    #[tokio::test]
    async fn test_recovery_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) = open(dir.path()).await;
            store.append_to_log(vec![make_entry(1, 1, b"a")]).await.unwrap();
            store.append_to_log(vec![make_entry(2, 1, b"b")]).await.unwrap();
        }

        let (mut store, _) = open(dir.path()).await;
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 2);
        assert_eq!(store.try_get_log_entries(1..=2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) = open(dir.path()).await;
            store
                .append_to_log(vec![make_entry(1, 1, b"a"), make_entry(2, 1, b"b")])
                .await
                .unwrap();
        }

        let mut log = OpenOptions::new()
            .append(true)
            .open(dir.path().join(LOG_FILE))
            .unwrap();
        log.write_all(&RAFT_MAGIC.to_le_bytes()).unwrap();
        log.write_all(&[0xff; 10]).unwrap();
        drop(log);

        let (mut store, _) = open(dir.path()).await;
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 2)));
    }

    #[tokio::test]
    async fn test_conflict_truncation_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) = open(dir.path()).await;
            let entries = (1..=5).map(|i| make_entry(i, 1, b"old")).collect::<Vec<_>>();
            store.append_to_log(entries).await.unwrap();
            store.delete_conflict_logs_since(log_id(1, 3)).await.unwrap();
        }

        {
            let (mut store, _) = open(dir.path()).await;
            let state = store.get_log_state().await.unwrap();
            assert_eq!(state.last_log_id, Some(log_id(1, 2)));
            store.append_to_log(vec![make_entry(3, 2, b"new")]).await.unwrap();
        }

        let (mut store, _) = open(dir.path()).await;
        let entries = store.try_get_log_entries(1..).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].log_id, log_id(2, 3));
    }

    #[tokio::test]
    async fn test_purge_logs() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) = open(dir.path()).await;
            let entries = (1..=5).map(|i| make_entry(i, 1, b"x")).collect::<Vec<_>>();
            store.append_to_log(entries).await.unwrap();

            store.purge_logs_upto(log_id(1, 3)).await.unwrap();

            let entries = store.try_get_log_entries(1..=5).await.unwrap();
            let indexes: Vec<u64> = entries.iter().map(|e| e.log_id.index).collect();
            assert_eq!(indexes, vec![4, 5]);
        }

        let (mut store, _) = open(dir.path()).await;
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(1, 3)));
        assert_eq!(state.last_log_id, Some(log_id(1, 5)));
        assert_eq!(store.try_get_log_entries(..).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_forwards_normal_entries() {
        let dir = TempDir::new().unwrap();
        let (mut store, fsm) = open(dir.path()).await;

        let entries = vec![
            Entry {
                log_id: log_id(1, 1),
                payload: EntryPayload::Blank,
            },
            make_entry(2, 1, b"create"),
            make_entry(3, 1, b"insert"),
        ];

        let responses = store.apply_to_state_machine(&entries).await.unwrap();
        assert_eq!(
            responses,
            vec![
                ApplyResponse::Skipped,
                ApplyResponse::Executed { rows_affected: 1 },
                ApplyResponse::Executed { rows_affected: 2 },
            ]
        );
        assert_eq!(fsm.applied().await, vec![b"create".to_vec(), b"insert".to_vec()]);

        let (last_applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(last_applied, Some(log_id(1, 3)));
    }

    #[tokio::test]
    async fn test_corrupt_entry_fails_apply() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path()).await;

        let result = store
            .apply_to_state_machine(&[make_entry(1, 1, b"corrupt")])
            .await;
        assert!(result.is_err());
        assert_eq!(store.last_applied().await, None);
    }

    #[tokio::test]
    async fn test_snapshot_build_and_recover() {
        let dir = TempDir::new().unwrap();
        {
            let (mut store, _) = open(dir.path()).await;
            store
                .apply_to_state_machine(&[make_entry(1, 1, b"a"), make_entry(2, 1, b"b")])
                .await
                .unwrap();

            let snapshot = store.build_snapshot().await.unwrap();
            assert_eq!(snapshot.meta.last_log_id, Some(log_id(1, 2)));
            assert_eq!(snapshot.meta.snapshot_id, "1_2_1");
        }

        let (mut store, fsm) = open(dir.path()).await;
        assert_eq!(fsm.applied().await, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(store.last_applied().await, Some(log_id(1, 2)));

        let current = store.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, "1_2_1");

        // The counter keeps increasing across restarts.
        let next = store.build_snapshot().await.unwrap();
        assert_eq!(next.meta.snapshot_id, "1_2_2");
    }

    #[tokio::test]
    async fn test_only_newest_snapshots_are_retained() {
        let dir = TempDir::new().unwrap();
        let (mut store, _) = open(dir.path()).await;

        for i in 1..=4 {
            store
                .apply_to_state_machine(&[make_entry(i, 1, b"x")])
                .await
                .unwrap();
            store.build_snapshot().await.unwrap();
        }

        let files = SnapshotStore::open(dir.path().join("snapshots"), 2)
            .unwrap()
            .list()
            .unwrap();
        let indexes: Vec<u64> = files.iter().map(|f| f.index).collect();
        assert_eq!(indexes, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_install_snapshot_replaces_state() {
        let leader_dir = TempDir::new().unwrap();
        let (mut leader, _) = open(leader_dir.path()).await;
        leader
            .apply_to_state_machine(&[make_entry(1, 1, b"a"), make_entry(2, 1, b"b")])
            .await
            .unwrap();
        let snapshot = leader.build_snapshot().await.unwrap();

        let follower_dir = TempDir::new().unwrap();
        let (mut follower, fsm) = open(follower_dir.path()).await;
        follower
            .apply_to_state_machine(&[make_entry(1, 1, b"stale")])
            .await
            .unwrap();

        follower
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(fsm.applied().await, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(follower.last_applied().await, Some(log_id(1, 2)));
        assert!(follower.get_current_snapshot().await.unwrap().is_some());

        // A restart restores from the installed snapshot.
        drop(follower);
        let (_, fsm) = open(follower_dir.path()).await;
        assert_eq!(fsm.applied().await.len(), 2);
    }
}
