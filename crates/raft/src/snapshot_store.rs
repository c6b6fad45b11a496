//! Snapshot files on disk.
//!
//! Each snapshot lives in `{dir}/{snapshot_id}.snap`, where the id is
//! `{term}_{index}_{seq}`. A file holds a little-endian `u32` metadata length,
//! the metadata as JSON, and then the raw snapshot stream.
//!
//! Snapshots are written to a `.tmp` file through a [`FileSnapshotSink`] and
//! renamed into place on close, so a crash never leaves a partial `.snap`.

use crate::state_machine::SnapshotSink;
use crate::type_config::SnapshotMeta;
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

const SNAPSHOT_EXT: &str = "snap";
const TMP_EXT: &str = "tmp";

/// A snapshot file found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub term: u64,
    pub index: u64,
    pub seq: u64,
}

/// Directory of snapshot files with a retention limit.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    /// Open the snapshot directory, creating it if needed and discarding
    /// leftovers from interrupted writes.
    pub fn open(dir: impl AsRef<Path>, retain: usize) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == TMP_EXT) {
                warn!(path = %path.display(), "removing incomplete snapshot");
                fs::remove_file(&path)?;
            }
        }

        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All complete snapshots, oldest first.
    pub fn list(&self) -> io::Result<Vec<SnapshotFile>> {
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == SNAPSHOT_EXT) {
                continue;
            }
            let Some((term, index, seq)) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(parse_snapshot_id)
            else {
                continue;
            };
            snapshots.push(SnapshotFile {
                path,
                term,
                index,
                seq,
            });
        }
        snapshots.sort_by_key(|s| (s.index, s.term, s.seq));
        Ok(snapshots)
    }

    /// The newest complete snapshot, if any.
    pub fn latest(&self) -> io::Result<Option<SnapshotFile>> {
        Ok(self.list()?.pop())
    }

    /// Highest sequence number among the files on disk.
    pub fn max_seq(&self) -> io::Result<u64> {
        Ok(self.list()?.iter().map(|s| s.seq).max().unwrap_or(0))
    }

    /// Read a snapshot file into its metadata and stream bytes.
    pub async fn read(path: &Path) -> io::Result<(SnapshotMeta, Vec<u8>)> {
        let mut file = tokio::fs::File::open(path).await?;

        let meta_len = file.read_u32_le().await? as usize;
        let mut meta_buf = vec![0u8; meta_len];
        file.read_exact(&mut meta_buf).await?;
        let meta: SnapshotMeta = serde_json::from_slice(&meta_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        Ok((meta, data))
    }

    /// Start writing a new snapshot described by `meta`.
    pub async fn create(&self, meta: &SnapshotMeta) -> io::Result<FileSnapshotSink> {
        if parse_snapshot_id(&meta.snapshot_id).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid snapshot id {:?}", meta.snapshot_id),
            ));
        }

        let final_path = self
            .dir
            .join(format!("{}.{}", meta.snapshot_id, SNAPSHOT_EXT));
        let tmp_path = self.dir.join(format!("{}.{}", meta.snapshot_id, TMP_EXT));

        let file = tokio::fs::File::create(&tmp_path).await?;
        let mut writer = BufWriter::new(file);

        let meta_bytes = serde_json::to_vec(meta).map_err(io::Error::other)?;
        writer.write_u32_le(meta_bytes.len() as u32).await?;
        writer.write_all(&meta_bytes).await?;

        debug!(id = %meta.snapshot_id, "creating snapshot");
        Ok(FileSnapshotSink {
            id: meta.snapshot_id.clone(),
            dir: self.dir.clone(),
            tmp_path,
            final_path,
            writer: Some(writer),
        })
    }

    /// Delete all but the newest snapshots. Returns how many were removed.
    pub fn prune(&self) -> io::Result<usize> {
        let snapshots = self.list()?;
        let excess = snapshots.len().saturating_sub(self.retain);
        for old in &snapshots[..excess] {
            debug!(path = %old.path.display(), "pruning snapshot");
            fs::remove_file(&old.path)?;
        }
        Ok(excess)
    }
}

/// Parse `{term}_{index}_{seq}`.
fn parse_snapshot_id(id: &str) -> Option<(u64, u64, u64)> {
    let mut parts = id.split('_');
    let term = parts.next()?.parse().ok()?;
    let index = parts.next()?.parse().ok()?;
    let seq = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((term, index, seq))
}

/// [`SnapshotSink`] writing to a temporary file that becomes a `.snap` file
/// on close.
#[derive(Debug)]
pub struct FileSnapshotSink {
    id: String,
    dir: PathBuf,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
}

impl FileSnapshotSink {
    /// Location of the snapshot once closed.
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    fn finished() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "snapshot sink is finished")
    }
}

impl AsyncWrite for FileSnapshotSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(Self::finished())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[async_trait]
impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut writer = self.writer.take().ok_or_else(Self::finished)?;
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;
        fs::File::open(&self.dir)?.sync_all()?;

        debug!(id = %self.id, path = %self.final_path.display(), "snapshot closed");
        Ok(())
    }

    async fn cancel(&mut self) -> io::Result<()> {
        if self.writer.take().is_none() {
            return Ok(());
        }
        match tokio::fs::remove_file(&self.tmp_path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        debug!(id = %self.id, "snapshot cancelled");
        Ok(())
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}
