//! File-call front end used by the proxy: small-integer handles mapped to
//! cache sessions, plus the open/read/write/lseek/close/unlink calls.

use crate::cache::{ClientCache, Session};
use crate::error::{SnapError, SnapResult};
use crate::path::{PathNormalizer, RelativePathNormalizer};
use crate::types::{OpenOption, Whence};
use crate::util::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

enum Slot<T> {
    Free,
    Reserved,
    Bound(T),
}

/// Handle table with a fixed upper bound. The lowest free handle is handed
/// out first.
pub struct SessionTable<T> {
    slots: Vec<Slot<T>>,
    limit: usize,
}

impl<T> SessionTable<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit,
        }
    }

    pub fn allocate_handle(&mut self) -> SnapResult<i32> {
        let index = match self.slots.iter().position(|s| matches!(s, Slot::Free)) {
            Some(index) => index,
            None if self.slots.len() < self.limit => {
                self.slots.push(Slot::Free);
                self.slots.len() - 1
            }
            None => return Err(SnapError::TooManyOpenFiles),
        };
        self.slots[index] = Slot::Reserved;
        Ok(index as i32)
    }

    pub fn bind(&mut self, fd: i32, value: T) -> SnapResult<()> {
        match self.slot_mut(fd) {
            Some(slot) if matches!(slot, Slot::Reserved) => {
                *slot = Slot::Bound(value);
                Ok(())
            }
            _ => Err(SnapError::BadHandle(fd)),
        }
    }

    pub fn resolve(&self, fd: i32) -> SnapResult<&T> {
        let slot = usize::try_from(fd).ok().and_then(|i| self.slots.get(i));
        match slot {
            Some(Slot::Bound(value)) => Ok(value),
            _ => Err(SnapError::BadHandle(fd)),
        }
    }

    /// Free the handle, returning what was bound to it.
    pub fn release(&mut self, fd: i32) -> SnapResult<Option<T>> {
        match self.slot_mut(fd) {
            Some(slot) if !matches!(slot, Slot::Free) => {
                match std::mem::replace(slot, Slot::Free) {
                    Slot::Bound(value) => Ok(Some(value)),
                    _ => Ok(None),
                }
            }
            _ => Err(SnapError::BadHandle(fd)),
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, Slot::Free))
            .count()
    }

    fn slot_mut(&mut self, fd: i32) -> Option<&mut Slot<T>> {
        usize::try_from(fd).ok().and_then(|i| self.slots.get_mut(i))
    }
}

// `None` once closed while another call still held the session
type SharedSession = Arc<AsyncMutex<Option<Session>>>;

pub struct FileService {
    cache: ClientCache,
    sessions: Mutex<SessionTable<SharedSession>>,
    normalizer: Box<dyn PathNormalizer>,
}

impl FileService {
    pub fn new(cache: ClientCache, max_open_files: usize) -> Self {
        Self::with_normalizer(cache, max_open_files, RelativePathNormalizer)
    }

    pub fn with_normalizer(
        cache: ClientCache,
        max_open_files: usize,
        normalizer: impl PathNormalizer + 'static,
    ) -> Self {
        Self {
            cache,
            sessions: Mutex::new(SessionTable::new(max_open_files)),
            normalizer: Box::new(normalizer),
        }
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    pub fn open_sessions(&self) -> usize {
        lock(&self.sessions).open_count()
    }

    pub async fn open(&self, raw: &str, option: OpenOption) -> SnapResult<i32> {
        let path = self.normalizer.normalize(raw)?;
        let fd = lock(&self.sessions).allocate_handle()?;
        match self.cache.check_and_open(&path, option.into()).await {
            Ok(session) => {
                let shared = Arc::new(AsyncMutex::new(Some(session)));
                lock(&self.sessions).bind(fd, shared)?;
                info!(fd, %path, ?option, "open");
                Ok(fd)
            }
            Err(e) => {
                let _ = lock(&self.sessions).release(fd);
                debug!(%path, ?option, "open failed: {e}");
                Err(e)
            }
        }
    }

    fn session(&self, fd: i32) -> SnapResult<SharedSession> {
        lock(&self.sessions).resolve(fd).cloned()
    }

    pub async fn read(&self, fd: i32, len: usize) -> SnapResult<Vec<u8>> {
        let shared = self.session(fd)?;
        let mut held = shared.lock().await;
        let session = held.as_mut().ok_or(SnapError::BadHandle(fd))?;
        if session.is_directory() {
            return Err(SnapError::IsADirectory(session.path().to_string()));
        }
        session.read(len).await
    }

    pub async fn write(&self, fd: i32, data: &[u8]) -> SnapResult<usize> {
        let shared = self.session(fd)?;
        let mut held = shared.lock().await;
        let session = held.as_mut().ok_or(SnapError::BadHandle(fd))?;
        if !session.is_writable() {
            return Err(SnapError::BadHandle(fd));
        }
        session.write(data).await
    }

    pub async fn lseek(&self, fd: i32, offset: i64, whence: Whence) -> SnapResult<u64> {
        let shared = self.session(fd)?;
        let mut held = shared.lock().await;
        let session = held.as_mut().ok_or(SnapError::BadHandle(fd))?;
        if session.is_directory() {
            return Err(SnapError::BadHandle(fd));
        }
        session.seek(offset, whence).await
    }

    pub async fn close(&self, fd: i32) -> SnapResult<()> {
        let shared = lock(&self.sessions)
            .release(fd)?
            .ok_or(SnapError::BadHandle(fd))?;
        let session = shared.lock().await.take().ok_or(SnapError::BadHandle(fd))?;
        let path = session.path().to_string();
        let result = session.close().await;
        info!(fd, %path, ok = result.is_ok(), "close");
        result
    }

    pub async fn unlink(&self, raw: &str) -> SnapResult<()> {
        let path = self.normalizer.normalize(raw)?;
        let result = self.cache.unlink(&path).await;
        info!(%path, ok = result.is_ok(), "unlink");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_reused_lowest_first() {
        let mut table = SessionTable::new(3);
        let a = table.allocate_handle().unwrap();
        let b = table.allocate_handle().unwrap();
        table.bind(a, "a").unwrap();
        table.bind(b, "b").unwrap();
        assert_eq!((a, b), (0, 1));

        assert_eq!(table.release(a).unwrap(), Some("a"));
        assert_eq!(table.allocate_handle().unwrap(), 0);
        assert_eq!(table.open_count(), 2);
    }

    #[test]
    fn test_limit_and_bad_handles() {
        let mut table: SessionTable<u8> = SessionTable::new(2);
        table.allocate_handle().unwrap();
        table.allocate_handle().unwrap();
        assert!(matches!(table.allocate_handle(), Err(SnapError::TooManyOpenFiles)));

        // reserved but not yet bound
        assert!(matches!(table.resolve(0), Err(SnapError::BadHandle(0))));
        assert!(matches!(table.resolve(-1), Err(SnapError::BadHandle(-1))));
        assert!(matches!(table.resolve(7), Err(SnapError::BadHandle(7))));
        assert!(matches!(table.bind(9, 1), Err(SnapError::BadHandle(9))));

        table.bind(1, 5).unwrap();
        assert!(matches!(table.bind(1, 6), Err(SnapError::BadHandle(1))));
        assert_eq!(*table.resolve(1).unwrap(), 5);
        assert_eq!(table.release(0).unwrap(), None);
        assert!(matches!(table.release(0), Err(SnapError::BadHandle(0))));
    }
}
