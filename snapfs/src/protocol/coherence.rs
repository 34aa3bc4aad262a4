//! Client half of the coherence protocol.
//!
//! Wraps a `Transport` with the hard per-call timeout, turns `Error(status)`
//! replies into `SnapError`s and treats any reply of the wrong kind as a
//! protocol violation that aborts the current operation.

use super::{AuthorityRequest, AuthorityResponse, CHUNK_SIZE, TransferId};
use crate::error::{SnapError, SnapResult};
use crate::transport::{Transport, TransportError};
use crate::types::{Perms, VersionId, VersionStamp};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, warn};

/// A newer version announced by the authority, with the bytes that rode on
/// the reply and the handle for the rest.
#[derive(Debug)]
pub struct Download {
    pub version: VersionStamp,
    pub perms: Perms,
    pub size: u64,
    pub first_chunk: Vec<u8>,
    pub transfer: Option<TransferId>,
}

#[derive(Debug)]
pub enum CheckReply {
    NoUpdate { version: VersionStamp, perms: Perms },
    NewVersion(Download),
    NotExist,
    IsDir,
}

#[derive(Clone)]
pub struct CoherenceClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    chunk_size: usize,
}

impl CoherenceClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn call(&self, request: AuthorityRequest, path: &str) -> SnapResult<AuthorityResponse> {
        let response = tokio::time::timeout(self.timeout, self.transport.call(request))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;
        match response {
            AuthorityResponse::Error(code) => Err(SnapError::from_status(code, path)),
            other => Ok(other),
        }
    }

    /// Ask whether `known` is still current for `path`. With `probe` the
    /// authority answers existence only and never streams bytes.
    pub async fn check(
        &self,
        path: &str,
        known: Option<VersionId>,
        probe: bool,
    ) -> SnapResult<CheckReply> {
        let request = AuthorityRequest::Check {
            path: path.to_string(),
            known,
            probe,
        };
        match self.call(request, path).await? {
            AuthorityResponse::NoUpdate { version, perms } => {
                Ok(CheckReply::NoUpdate { version, perms })
            }
            AuthorityResponse::NewVersion {
                version,
                perms,
                size,
                first_chunk,
                transfer,
            } => Ok(CheckReply::NewVersion(Download {
                version,
                perms,
                size,
                first_chunk,
                transfer,
            })),
            AuthorityResponse::NotExist => Ok(CheckReply::NotExist),
            AuthorityResponse::IsDir => Ok(CheckReply::IsDir),
            other => Err(unexpected(path, "check", &other)),
        }
    }

    pub async fn read_chunk(&self, path: &str, transfer: TransferId) -> SnapResult<Vec<u8>> {
        match self.call(AuthorityRequest::ReadChunk { transfer }, path).await? {
            AuthorityResponse::Chunk(data) => Ok(data),
            other => Err(unexpected(path, "read_chunk", &other)),
        }
    }

    /// Best effort: a failure only leaks a server-side handle, which the
    /// authority drops with the connection.
    pub async fn close_transfer(&self, path: &str, transfer: TransferId) {
        match self.call(AuthorityRequest::CloseTransfer { transfer }, path).await {
            Ok(AuthorityResponse::Ack) => {}
            Ok(other) => {
                unexpected(path, "close_transfer", &other);
            }
            Err(e) => warn!(path, transfer, "failed to close transfer: {e}"),
        }
    }

    /// Write the whole of `download` into `dest`. The transfer handle is
    /// closed whatever the outcome.
    pub async fn fetch_into(&self, path: &str, download: &Download, dest: &mut File) -> SnapResult<()> {
        let streamed = async {
            dest.write_all(&download.first_chunk).await?;
            let mut received = download.first_chunk.len() as u64;
            if let Some(transfer) = download.transfer {
                while received < download.size {
                    let chunk = self.read_chunk(path, transfer).await?;
                    if chunk.is_empty() {
                        break;
                    }
                    received += chunk.len() as u64;
                    dest.write_all(&chunk).await?;
                }
            }
            if received != download.size {
                error!(path, received, expected = download.size, "short download");
                return Err(SnapError::Protocol(format!(
                    "received {received} of {} bytes for {path}",
                    download.size
                )));
            }
            dest.flush().await?;
            Ok::<(), SnapError>(())
        }
        .await;
        if let Some(transfer) = download.transfer {
            self.close_transfer(path, transfer).await;
        }
        streamed
    }

    /// Upload the contents of `source` as the next version of `path`.
    /// Returns the stamp and permission bits the authority assigned.
    pub async fn commit(&self, path: &str, source: &Path) -> SnapResult<(VersionStamp, Perms)> {
        let request = AuthorityRequest::BeginCommit {
            path: path.to_string(),
        };
        let transfer = match self.call(request, path).await? {
            AuthorityResponse::Transfer(id) => id,
            other => return Err(unexpected(path, "begin_commit", &other)),
        };

        let sent = async {
            let mut file = File::open(source).await?;
            let mut buf = vec![0u8; self.chunk_size];
            let mut total = 0u64;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                let request = AuthorityRequest::WriteChunk {
                    transfer,
                    data: buf[..n].to_vec(),
                };
                match self.call(request, path).await? {
                    AuthorityResponse::Ack => {}
                    other => return Err(unexpected(path, "write_chunk", &other)),
                }
            }
            Ok::<u64, SnapError>(total)
        }
        .await;
        let total = match sent {
            Ok(total) => total,
            Err(e) => {
                self.close_transfer(path, transfer).await;
                return Err(e);
            }
        };

        match self.call(AuthorityRequest::FinishCommit { transfer }, path).await? {
            AuthorityResponse::Committed { version, perms } => {
                debug!(path, bytes = total, seq = version.seq, "write-back committed");
                Ok((version, perms))
            }
            other => Err(unexpected(path, "finish_commit", &other)),
        }
    }

    pub async fn remove(&self, path: &str) -> SnapResult<()> {
        let request = AuthorityRequest::Remove {
            path: path.to_string(),
        };
        match self.call(request, path).await? {
            AuthorityResponse::Ack => Ok(()),
            other => Err(unexpected(path, "remove", &other)),
        }
    }
}

fn unexpected(path: &str, op: &str, response: &AuthorityResponse) -> SnapError {
    error!(path, op, reply = response.kind(), "authority sent a reply of the wrong kind");
    SnapError::Protocol(format!("{op} on {path} answered with {}", response.kind()))
}
