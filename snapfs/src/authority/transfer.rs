//! Server-side handles for downloads and uploads that span several calls.

use crate::protocol::TransferId;
use crate::util::lock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex as AsyncMutex;

pub enum Transfer {
    /// Reads a snapshot through a handle opened under the path lock, so a
    /// later publish (rename) does not change what this download sees.
    Download { file: File, remaining: u64 },
    /// Bytes land in `temp` until the commit is finished or aborted.
    Upload {
        path: String,
        temp: PathBuf,
        file: File,
    },
}

pub type SharedTransfer = Arc<AsyncMutex<Transfer>>;

pub struct TransferTable {
    next: AtomicU64,
    open: Mutex<HashMap<TransferId, SharedTransfer>>,
}

impl Default for TransferTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, transfer: Transfer) -> TransferId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        lock(&self.open).insert(id, Arc::new(AsyncMutex::new(transfer)));
        id
    }

    pub fn get(&self, id: TransferId) -> Option<SharedTransfer> {
        lock(&self.open).get(&id).cloned()
    }

    /// Retire the handle; later calls naming it fail.
    pub fn take(&self, id: TransferId) -> Option<SharedTransfer> {
        lock(&self.open).remove(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.open).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read up to `limit` bytes, stopping early only at end of file.
pub async fn read_up_to(file: &mut File, limit: u64) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit.min(1 << 20) as usize);
    file.take(limit).read_to_end(&mut buf).await?;
    Ok(buf)
}
