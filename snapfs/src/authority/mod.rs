//! The file-of-record side: answers staleness checks, streams snapshots to
//! clients and publishes their write-backs under fresh version stamps.
//!
//! Submodules:
//! - `table`: per-path version records and locks
//! - `transfer`: server-side download/upload handles
pub mod table;
pub mod transfer;

use crate::error::{SnapError, SnapResult};
use crate::path;
use crate::protocol::{AuthorityRequest, AuthorityResponse, TransferId};
use crate::types::VersionId;
use nix::unistd::{AccessFlags, access};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use table::{AuthorityFileTable, FileRecord, PathGuard};
pub use transfer::{Transfer, TransferTable};
use transfer::read_up_to;

pub struct Authority {
    table: AuthorityFileTable,
    transfers: TransferTable,
    chunk_size: usize,
}

impl Authority {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            table: AuthorityFileTable::new(root),
            transfers: TransferTable::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn table(&self) -> &AuthorityFileTable {
        &self.table
    }

    /// Downloads and uploads not yet closed or finished.
    pub fn open_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Dispatch one request. Failures travel back as `Error(status)`.
    pub async fn handle(&self, request: AuthorityRequest) -> AuthorityResponse {
        let result = match request {
            AuthorityRequest::Check { path, known, probe } => {
                self.check_or_fetch(&path, known, probe).await
            }
            AuthorityRequest::ReadChunk { transfer } => {
                self.read_chunk(transfer).await.map(AuthorityResponse::Chunk)
            }
            AuthorityRequest::CloseTransfer { transfer } => self
                .close_transfer(transfer)
                .await
                .map(|_| AuthorityResponse::Ack),
            AuthorityRequest::BeginCommit { path } => self
                .begin_commit(&path)
                .await
                .map(AuthorityResponse::Transfer),
            AuthorityRequest::WriteChunk { transfer, data } => self
                .write_chunk(transfer, &data)
                .await
                .map(|_| AuthorityResponse::Ack),
            AuthorityRequest::FinishCommit { transfer } => {
                self.finish_commit(transfer).await.map(|record| {
                    AuthorityResponse::Committed {
                        version: record.version,
                        perms: record.perms,
                    }
                })
            }
            AuthorityRequest::Remove { path } => {
                self.remove(&path).await.map(|_| AuthorityResponse::Ack)
            }
        };
        result.unwrap_or_else(|e| {
            debug!("request failed: {e}");
            AuthorityResponse::Error(e.status())
        })
    }

    /// Normalise `raw` and require every intermediate component to be an
    /// existing directory.
    fn validate(&self, raw: &str) -> SnapResult<String> {
        let canonical = path::normalize(raw)?;
        let mut dir = self.table.root().to_path_buf();
        let mut components: Vec<&str> = canonical.split('/').collect();
        components.pop();
        for component in components.into_iter().filter(|c| !c.is_empty()) {
            dir.push(component);
            match std::fs::metadata(&dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(SnapError::NotADirectory(canonical)),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(SnapError::NoSuchFile(canonical));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(canonical)
    }

    fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || self.table.backing_path(path).is_dir()
    }

    /// Answer whether `known` is still current for `path`, streaming the
    /// first chunk of the current bytes when it is not.
    pub async fn check_or_fetch(
        &self,
        raw: &str,
        known: Option<VersionId>,
        probe: bool,
    ) -> SnapResult<AuthorityResponse> {
        let path = self.validate(raw)?;
        if self.is_dir(&path) {
            return Ok(AuthorityResponse::IsDir);
        }

        let mut guard = self.table.lock_path(&path).await;
        let Some(record) = guard.resolve()? else {
            return Ok(AuthorityResponse::NotExist);
        };
        if known == Some(record.version.id) {
            return Ok(AuthorityResponse::NoUpdate {
                version: record.version,
                perms: record.perms,
            });
        }
        if probe {
            let size = std::fs::metadata(guard.backing())?.len();
            return Ok(AuthorityResponse::NewVersion {
                version: record.version,
                perms: record.perms,
                size,
                first_chunk: Vec::new(),
                transfer: None,
            });
        }
        if !record.perms.can_read {
            return Err(SnapError::PermissionDenied(path));
        }

        let mut file = File::open(guard.backing()).await?;
        drop(guard);
        let size = file.metadata().await?.len();
        let first_chunk = read_up_to(&mut file, self.chunk_size as u64).await?;
        let remaining = size.saturating_sub(first_chunk.len() as u64);
        let transfer = if remaining > 0 {
            Some(
                self.transfers
                    .register(Transfer::Download { file, remaining }),
            )
        } else {
            None
        };
        debug!(%path, seq = record.version.seq, size, ?transfer, "sending new version");
        Ok(AuthorityResponse::NewVersion {
            version: record.version,
            perms: record.perms,
            size,
            first_chunk,
            transfer,
        })
    }

    pub async fn read_chunk(&self, id: TransferId) -> SnapResult<Vec<u8>> {
        let shared = self.transfers.get(id).ok_or_else(|| unknown_transfer(id))?;
        let mut transfer = shared.lock().await;
        match &mut *transfer {
            Transfer::Download { file, remaining } => {
                let want = (*remaining).min(self.chunk_size as u64);
                let chunk = read_up_to(file, want).await?;
                *remaining -= chunk.len() as u64;
                Ok(chunk)
            }
            Transfer::Upload { .. } => Err(SnapError::InvalidArgument(format!(
                "transfer {id} is an upload"
            ))),
        }
    }

    /// Retire a transfer. An unfinished upload is aborted and its temp file
    /// deleted.
    pub async fn close_transfer(&self, id: TransferId) -> SnapResult<()> {
        let shared = self.transfers.take(id).ok_or_else(|| unknown_transfer(id))?;
        let transfer = shared.lock().await;
        if let Transfer::Upload { path, temp, .. } = &*transfer {
            info!(%path, transfer = id, "upload aborted");
            discard_temp(temp).await;
        }
        Ok(())
    }

    pub async fn begin_commit(&self, raw: &str) -> SnapResult<TransferId> {
        let path = self.validate(raw)?;
        if self.is_dir(&path) {
            return Err(SnapError::IsADirectory(path));
        }
        let backing = {
            let mut guard = self.table.lock_path(&path).await;
            match guard.resolve()? {
                Some(record) if !record.perms.can_write => {
                    return Err(SnapError::PermissionDenied(path));
                }
                Some(_) => {}
                None => {
                    let dir = self.table.backing_path(path::parent(&path).unwrap_or(""));
                    if access(&dir, AccessFlags::W_OK).is_err() {
                        return Err(SnapError::PermissionDenied(path));
                    }
                }
            }
            guard.backing()
        };

        let mut name: OsString = backing.into_os_string();
        name.push(format!(".{}.snapfs-tmp", Uuid::new_v4()));
        let temp = PathBuf::from(name);
        let file = File::create(&temp).await?;
        let id = self.transfers.register(Transfer::Upload {
            path: path.clone(),
            temp,
            file,
        });
        debug!(%path, transfer = id, "upload started");
        Ok(id)
    }

    pub async fn write_chunk(&self, id: TransferId, data: &[u8]) -> SnapResult<()> {
        let shared = self.transfers.get(id).ok_or_else(|| unknown_transfer(id))?;
        let mut transfer = shared.lock().await;
        match &mut *transfer {
            Transfer::Upload { file, .. } => {
                file.write_all(data).await?;
                Ok(())
            }
            Transfer::Download { .. } => Err(SnapError::InvalidArgument(format!(
                "transfer {id} is a download"
            ))),
        }
    }

    /// Publish an upload atomically and mint its version.
    pub async fn finish_commit(&self, id: TransferId) -> SnapResult<FileRecord> {
        let shared = self.transfers.take(id).ok_or_else(|| unknown_transfer(id))?;
        let mut transfer = shared.lock().await;
        let Transfer::Upload { path, temp, file } = &mut *transfer else {
            return Err(SnapError::InvalidArgument(format!(
                "transfer {id} is a download"
            )));
        };

        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = synced {
            discard_temp(temp).await;
            return Err(e.into());
        }

        let mut guard = self.table.lock_path(path).await;
        match guard.publish(temp) {
            Ok(record) => {
                info!(%path, seq = record.version.seq, version = %record.version.id, "committed");
                Ok(record)
            }
            Err(e) => {
                drop(guard);
                discard_temp(temp).await;
                Err(e)
            }
        }
    }

    pub async fn remove(&self, raw: &str) -> SnapResult<()> {
        let path = self.validate(raw)?;
        if self.is_dir(&path) {
            return Err(SnapError::IsADirectory(path));
        }
        let mut guard = self.table.lock_path(&path).await;
        if guard.resolve()?.is_none() {
            return Err(SnapError::NoSuchFile(path));
        }
        guard.remove()?;
        info!(%path, "removed");
        Ok(())
    }
}

fn unknown_transfer(id: TransferId) -> SnapError {
    SnapError::InvalidArgument(format!("unknown transfer {id}"))
}

async fn discard_temp(temp: &PathBuf) {
    if let Err(e) = tokio::fs::remove_file(temp).await {
        warn!("failed to delete upload temp {}: {e}", temp.display());
    }
}
