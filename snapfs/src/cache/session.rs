//! An open file: the span between an open call and its close, bound to one
//! pinned blob. All reads, writes and seeks touch local bytes only.

use super::BlobGuard;
use crate::error::{SnapError, SnapResult};
use crate::types::{VersionStamp, Whence};
use std::io::SeekFrom;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

enum SessionKind {
    /// Opened path is a directory; only closing is meaningful.
    Directory,
    File {
        guard: BlobGuard,
        file: File,
        pos: u64,
        writable: bool,
    },
}

pub struct Session {
    path: String,
    kind: SessionKind,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn directory(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: SessionKind::Directory,
        }
    }

    pub(crate) async fn open_file(path: &str, guard: BlobGuard, writable: bool) -> SnapResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(guard.blob().file_path())
            .await?;
        Ok(Self {
            path: path.to_string(),
            kind: SessionKind::File {
                guard,
                file,
                pos: 0,
                writable,
            },
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, SessionKind::Directory)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.kind, SessionKind::File { writable: true, .. })
    }

    pub fn len(&self) -> u64 {
        match &self.kind {
            SessionKind::Directory => 0,
            SessionKind::File { guard, .. } => guard.blob().size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        match &self.kind {
            SessionKind::Directory => 0,
            SessionKind::File { pos, .. } => *pos,
        }
    }

    /// Stamp of the snapshot this session works on. Provisional for write
    /// copies that were not published yet.
    pub fn version(&self) -> Option<VersionStamp> {
        match &self.kind {
            SessionKind::Directory => None,
            SessionKind::File { guard, .. } => Some(guard.blob().stamp()),
        }
    }

    /// Read up to `len` bytes at the current position.
    pub async fn read(&mut self, len: usize) -> SnapResult<Vec<u8>> {
        let SessionKind::File { file, pos, .. } = &mut self.kind else {
            return Err(SnapError::IsADirectory(self.path.clone()));
        };
        file.seek(SeekFrom::Start(*pos)).await?;
        let mut buf = Vec::with_capacity(len.min(1 << 20));
        file.take(len as u64).read_to_end(&mut buf).await?;
        *pos += buf.len() as u64;
        Ok(buf)
    }

    /// Write at the current position. Growth past the current size is
    /// reserved from the cache budget first.
    pub async fn write(&mut self, data: &[u8]) -> SnapResult<usize> {
        let SessionKind::File {
            guard,
            file,
            pos,
            writable: true,
        } = &mut self.kind
        else {
            return Err(SnapError::PermissionDenied(self.path.clone()));
        };
        if data.is_empty() {
            return Ok(0);
        }
        let end = *pos + data.len() as u64;
        let growth = guard.blob().growth_needed(end);
        guard.cache().reserve(growth).await?;

        let written = async {
            file.seek(SeekFrom::Start(*pos)).await?;
            file.write_all(data).await?;
            // a write-back may read the blob from another handle
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            guard.cache().give_back(growth);
            return Err(e.into());
        }
        guard.blob().record_write(end);
        *pos = end;
        Ok(data.len())
    }

    /// Move the position. Targets past the end are allowed; a later write
    /// there fills the gap with zeros.
    pub async fn seek(&mut self, offset: i64, whence: Whence) -> SnapResult<u64> {
        let SessionKind::File { guard, pos, .. } = &mut self.kind else {
            return Err(SnapError::IsADirectory(self.path.clone()));
        };
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => *pos,
            Whence::End => guard.blob().size(),
        };
        let target = i128::from(base) + i128::from(offset);
        if target < 0 || target > i128::from(i64::MAX) {
            return Err(SnapError::InvalidArgument(format!(
                "seek to {target} in {}",
                self.path
            )));
        }
        *pos = target as u64;
        Ok(*pos)
    }

    /// End the session. When this was the last reference on a modified
    /// copy, the write-back completes before this returns.
    pub async fn close(self) -> SnapResult<()> {
        let SessionKind::File { guard, mut file, .. } = self.kind else {
            return Ok(());
        };
        let flushed = file.flush().await;
        drop(file);
        let cache = guard.cache().clone();
        let released = guard.release().await;
        cache.touch(&self.path);
        flushed?;
        released
    }
}
