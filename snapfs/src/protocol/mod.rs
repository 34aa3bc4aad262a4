//! Wire messages exchanged between a client cache and the authority.
//!
//! Every call is one request answered by one response. File bytes travel in
//! chunks: the first chunk rides on the `Check` reply, the rest is pulled with
//! `ReadChunk` against a server-side transfer handle. Uploads mirror this
//! with `BeginCommit` / `WriteChunk` / `FinishCommit`.
pub mod coherence;

use crate::types::{Perms, StatusCode, VersionId, VersionStamp};
use serde::{Deserialize, Serialize};

pub use coherence::{CheckReply, CoherenceClient, Download};

pub const CHUNK_SIZE: usize = crate::config::DEFAULT_CHUNK_SIZE;

/// Server-side handle for an in-flight download or upload.
pub type TransferId = u64;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum AuthorityRequest {
    /// Is `known` still the current version of `path`? With `probe` set the
    /// authority only answers existence and never opens a transfer.
    Check {
        path: String,
        known: Option<VersionId>,
        probe: bool,
    },
    ReadChunk {
        transfer: TransferId,
    },
    /// Ends a download, or aborts an unfinished upload.
    CloseTransfer {
        transfer: TransferId,
    },
    BeginCommit {
        path: String,
    },
    WriteChunk {
        transfer: TransferId,
        data: Vec<u8>,
    },
    FinishCommit {
        transfer: TransferId,
    },
    Remove {
        path: String,
    },
}

impl AuthorityRequest {
    /// Transfer handle this request retires, if any.
    pub fn retires_transfer(&self) -> Option<TransferId> {
        match self {
            AuthorityRequest::CloseTransfer { transfer }
            | AuthorityRequest::FinishCommit { transfer } => Some(*transfer),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum AuthorityResponse {
    NoUpdate {
        version: VersionStamp,
        perms: Perms,
    },
    NewVersion {
        version: VersionStamp,
        perms: Perms,
        size: u64,
        first_chunk: Vec<u8>,
        /// Present only when bytes remain after `first_chunk`.
        transfer: Option<TransferId>,
    },
    NotExist,
    IsDir,
    Chunk(Vec<u8>),
    Transfer(TransferId),
    Committed {
        version: VersionStamp,
        perms: Perms,
    },
    Ack,
    Error(StatusCode),
}

impl AuthorityResponse {
    /// Transfer handle this response hands to the caller, if any.
    pub fn opened_transfer(&self) -> Option<TransferId> {
        match self {
            AuthorityResponse::NewVersion {
                transfer: Some(id), ..
            }
            | AuthorityResponse::Transfer(id) => Some(*id),
            _ => None,
        }
    }

    /// Short variant name for log lines and protocol-violation reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthorityResponse::NoUpdate { .. } => "NoUpdate",
            AuthorityResponse::NewVersion { .. } => "NewVersion",
            AuthorityResponse::NotExist => "NotExist",
            AuthorityResponse::IsDir => "IsDir",
            AuthorityResponse::Chunk(_) => "Chunk",
            AuthorityResponse::Transfer(_) => "Transfer",
            AuthorityResponse::Committed { .. } => "Committed",
            AuthorityResponse::Ack => "Ack",
            AuthorityResponse::Error(_) => "Error",
        }
    }
}
