//! Snapshot codec: a database export directory as a tar stream.
//!
//! A snapshot starts life as an [`ExportedSnapshot`], a temporary directory
//! the engine dumped its full state into. Persisting walks that directory
//! depth-first (parents before children, names sorted) and writes one tar
//! entry per path. Restoring unpacks such a stream into a staging directory
//! with [`unpack`], accepting only directories and regular files.

use async_trait::async_trait;
use futures::StreamExt;
use raft::{SnapshotSink, StateMachineError, StateMachineSnapshot};
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

/// Prefix of the temporary directories holding exports.
pub const SNAPSHOT_DIR_PREFIX: &str = "sqlraft_snapshot_";

/// Prefix of the temporary directories snapshots are unpacked into.
pub const RESTORE_DIR_PREFIX: &str = "sqlraft_restore_";

const PIPE_CAPACITY: usize = 64 * 1024;

/// A full export waiting to be written into a snapshot sink.
pub struct ExportedSnapshot {
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
}

impl ExportedSnapshot {
    /// Take ownership of an export directory. It is deleted on
    /// [`release`](StateMachineSnapshot::release) or drop.
    pub fn new(dir: TempDir) -> Self {
        Self {
            path: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_released(&self) -> bool {
        self.dir.lock().map(|dir| dir.is_none()).unwrap_or(true)
    }
}

#[async_trait]
impl StateMachineSnapshot for ExportedSnapshot {
    async fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), StateMachineError> {
        let id = sink.id().to_string();
        let result = if self.is_released() {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                "snapshot export already released",
            ))
        } else {
            stream_archive(self.path.clone(), sink).await
        };

        match result {
            Ok(bytes) => {
                sink.close().await?;
                info!(snapshot = %id, bytes, "snapshot persisted");
                Ok(())
            }
            Err(e) => {
                warn!(snapshot = %id, error = %e, "snapshot persist failed, cancelling");
                if let Err(cancel) = sink.cancel().await {
                    warn!(snapshot = %id, error = %cancel, "failed to cancel snapshot sink");
                }
                Err(StateMachineError::Snapshot(e.to_string()))
            }
        }
    }

    async fn release(&self) {
        let dir = match self.dir.lock() {
            Ok(mut dir) => dir.take(),
            Err(_) => None,
        };
        let Some(dir) = dir else {
            return;
        };
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => debug!(path = %path.display(), "released snapshot export"),
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "failed to remove snapshot export"),
            Err(e) => warn!(error = %e, "snapshot release task failed"),
        }
    }
}

/// Build the archive for `root` on a separate task and copy it into `sink`.
async fn stream_archive(root: PathBuf, sink: &mut dyn SnapshotSink) -> io::Result<u64> {
    let (writer, mut reader) = tokio::io::duplex(PIPE_CAPACITY);
    let builder = tokio::spawn(write_archive(root, writer));

    let copied = tokio::io::copy(&mut reader, &mut *sink).await;
    // Unblocks the builder if the copy stopped early.
    drop(reader);
    let built = builder.await.map_err(io::Error::other)?;

    let bytes = copied?;
    built?;
    sink.flush().await?;
    Ok(bytes)
}

/// Write a tar archive of everything below `root` into `writer`.
pub async fn write_archive<W>(root: PathBuf, writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let walk_root = root.clone();
    let paths = tokio::task::spawn_blocking(move || walk(&walk_root))
        .await
        .map_err(io::Error::other)??;

    let mut builder = Builder::new(writer);
    for relative in paths {
        let full = root.join(&relative);
        let meta = tokio::fs::symlink_metadata(&full).await?;

        let mut header = Header::new_gnu();
        header.set_mode(mode_of(&meta));
        header.set_mtime(mtime_of(&meta));
        if meta.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &relative, tokio::io::empty())
                .await?;
        } else if meta.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let file = tokio::fs::File::open(&full).await?;
            builder.append_data(&mut header, &relative, file).await?;
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported file type at {}", full.display()),
            ));
        }
        debug!(path = %relative.display(), "archived");
    }

    builder.finish().await?;
    let mut writer = builder.into_inner().await?;
    writer.shutdown().await
}

/// All paths below `root`, relative to it, parents before children with
/// siblings sorted by name.
fn walk(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk_into(root, Path::new(""), &mut out)?;
    Ok(out)
}

fn walk_into(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut names = std::fs::read_dir(root.join(relative))?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();

    for name in names {
        let child = relative.join(&name);
        let is_dir = std::fs::symlink_metadata(root.join(&child))?.is_dir();
        out.push(child.clone());
        if is_dir {
            walk_into(root, &child, out)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn mtime_of(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Unpack the tar stream `data` into `dest`.
///
/// Only directories and regular files are accepted, and no entry may land
/// outside `dest`. Returns the number of entries written.
pub async fn unpack<R>(data: R, dest: &Path) -> io::Result<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut archive = Archive::new(data);
    let mut entries = archive.entries()?;
    let mut count = 0;

    while let Some(entry) = entries.next().await {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        let path = entry.path()?.into_owned();

        if !(entry_type.is_dir() || entry_type.is_file()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unsupported entry type {:?} for {}",
                    entry_type,
                    path.display()
                ),
            ));
        }
        if escapes(&path) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry path escapes restore directory: {}", path.display()),
            ));
        }
        if !entry.unpack_in(dest).await? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("refused to unpack {}", path.display()),
            ));
        }
        count += 1;
    }

    debug!(entries = count, dest = %dest.display(), "unpacked snapshot");
    Ok(count)
}

fn escapes(path: &Path) -> bool {
    path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
