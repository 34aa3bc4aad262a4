//! Client-side whole-file cache.
//!
//! Responsibilities:
//! - keep one entry per path holding the newest known version of the file
//! - order entries by recency and evict the least recently used ones that no
//!   session is using when space runs out
//! - account every cached byte against a fixed budget
//! - turn an open call into a session on a consistent snapshot, talking to
//!   the authority only to check staleness, fetch and write back
//!
//! Locking: the path table and its recency order share one mutex. The free
//! space counter has its own. Reservations are serialized by an async gate
//! that is held across the whole evict-then-subtract sequence. No network
//! call is made while the table or counter mutex is held. Blobs that live
//! in the table are only ever acquired under the table mutex, so their
//! reference count is stable for an eviction scan holding that mutex.
pub mod blob;
pub mod session;

use crate::config::CacheConfig;
use crate::error::{SnapError, SnapResult};
use crate::protocol::{CheckReply, CoherenceClient, Download};
use crate::types::{OpenMode, Perms, VersionStamp};
use crate::util::lock;
use lru::LruCache;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use blob::{Released, VersionedBlob};
pub use session::Session;

const BLOB_EXTENSION: &str = "blob";
const OPEN_ATTEMPTS: u32 = 3;

/// Table record for one path. The entry owns one reference on `newest`.
pub struct CacheEntry {
    newest: Arc<VersionedBlob>,
}

impl CacheEntry {
    pub fn newest(&self) -> &Arc<VersionedBlob> {
        &self.newest
    }
}

struct CacheInner {
    dir: PathBuf,
    capacity: u64,
    eviction_wait: Duration,
    coherence: CoherenceClient,
    // most recently used first
    entries: Mutex<LruCache<String, CacheEntry>>,
    free: Mutex<u64>,
    reserve_gate: AsyncMutex<()>,
    // signalled whenever a blob reference is dropped
    released: Notify,
}

#[derive(Clone)]
pub struct ClientCache {
    inner: Arc<CacheInner>,
}

impl ClientCache {
    /// Prepare the cache directory, deleting blobs left over from an
    /// earlier run. The table starts empty.
    pub fn new(config: &CacheConfig, coherence: CoherenceClient) -> SnapResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let mut purged = 0usize;
        for entry in std::fs::read_dir(&config.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == BLOB_EXTENSION) {
                std::fs::remove_file(&path)?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!("purged {purged} stale blobs from {}", config.dir.display());
        }

        Ok(Self {
            inner: Arc::new(CacheInner {
                dir: config.dir.clone(),
                capacity: config.capacity_bytes,
                eviction_wait: config.eviction_wait(),
                coherence,
                entries: Mutex::new(LruCache::unbounded()),
                free: Mutex::new(config.capacity_bytes),
                reserve_gate: AsyncMutex::new(()),
                released: Notify::new(),
            }),
        })
    }

    pub fn coherence(&self) -> &CoherenceClient {
        &self.inner.coherence
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    pub fn free_space(&self) -> u64 {
        *lock(&self.inner.free)
    }

    pub fn contains(&self, path: &str) -> bool {
        lock(&self.inner.entries).contains(path)
    }

    /// Cached paths, most recently used first.
    pub fn cached_paths(&self) -> Vec<String> {
        lock(&self.inner.entries)
            .iter()
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn newest_version(&self, path: &str) -> Option<VersionStamp> {
        lock(&self.inner.entries)
            .peek(path)
            .map(|entry| entry.newest.stamp())
    }

    /// References held on the newest blob of `path`, the table's included.
    pub fn ref_count(&self, path: &str) -> Option<u32> {
        lock(&self.inner.entries)
            .peek(path)
            .map(|entry| entry.newest.ref_count())
    }

    /// Open `path` for one session. A version that vanishes between the
    /// staleness check and its use is retried from the top a bounded number
    /// of times. A file that keeps vanishing surfaces as `Stale`.
    pub async fn check_and_open(&self, path: &str, mode: OpenMode) -> SnapResult<Session> {
        let mut attempt = 1;
        loop {
            match self.try_open(path, mode).await {
                Err(SnapError::Stale(_)) if attempt < OPEN_ATTEMPTS => {
                    debug!(path, attempt, "cached version went stale, retrying open");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_open(&self, path: &str, mode: OpenMode) -> SnapResult<Session> {
        let coherence = &self.inner.coherence;
        if mode.exclusive {
            return match coherence.check(path, None, true).await? {
                CheckReply::NotExist => {
                    self.remove(path);
                    self.open_created(path).await
                }
                _ => Err(SnapError::AlreadyExists(path.to_string())),
            };
        }

        let known = self.newest_version(path).map(|stamp| stamp.id);
        match coherence.check(path, known, false).await? {
            CheckReply::IsDir => {
                if mode.mutates() {
                    return Err(SnapError::IsADirectory(path.to_string()));
                }
                self.remove(path);
                Ok(Session::directory(path))
            }
            CheckReply::NotExist => {
                if self.remove(path) {
                    return Err(SnapError::Stale(path.to_string()));
                }
                if mode.create {
                    self.open_created(path).await
                } else {
                    Err(SnapError::NoSuchFile(path.to_string()))
                }
            }
            CheckReply::NoUpdate { version, perms } => {
                let blob = self.pin_newest(path, version, perms)?;
                self.open_blob(blob, mode).await
            }
            CheckReply::NewVersion(download) => {
                let blob = self.fetch(path, download).await?;
                self.open_blob(blob, mode).await
            }
        }
    }

    /// Pin the cached blob the authority just confirmed as current.
    fn pin_newest(
        &self,
        path: &str,
        version: VersionStamp,
        perms: Perms,
    ) -> SnapResult<Arc<VersionedBlob>> {
        let mut entries = lock(&self.inner.entries);
        let Some(entry) = entries.get(path) else {
            return Err(SnapError::Stale(path.to_string()));
        };
        let newest = &entry.newest;
        let stamp = newest.stamp();
        if !stamp.covers(&version) {
            return Err(SnapError::Stale(path.to_string()));
        }
        if stamp.id == version.id {
            newest.set_perms(perms);
        }
        if !newest.acquire() {
            return Err(SnapError::Stale(path.to_string()));
        }
        Ok(newest.clone())
    }

    /// Stream a new version into a fresh blob and install it. Returns the
    /// pinned newest blob, which is an already installed newer version if
    /// one won the race.
    async fn fetch(&self, path: &str, download: Download) -> SnapResult<Arc<VersionedBlob>> {
        let coherence = &self.inner.coherence;
        if let Err(e) = self.reserve(download.size).await {
            if let Some(transfer) = download.transfer {
                coherence.close_transfer(path, transfer).await;
            }
            return Err(e);
        }

        let blob = Arc::new(VersionedBlob::new(
            path,
            self.blob_file(path),
            download.version,
            download.perms,
            download.size,
            false,
        ));
        let fetched = match File::create(blob.file_path()).await {
            Ok(mut dest) => coherence.fetch_into(path, &download, &mut dest).await,
            Err(e) => {
                if let Some(transfer) = download.transfer {
                    coherence.close_transfer(path, transfer).await;
                }
                Err(e.into())
            }
        };
        if let Err(e) = fetched {
            warn!(path, "fetch failed: {e}");
            self.release_detached(blob);
            return Err(e);
        }

        debug!(path, seq = download.version.seq, size = download.size, "fetched new version");
        self.install(blob, true)
            .ok_or_else(|| SnapError::Stale(path.to_string()))
    }

    /// Make `blob` the newest version of its path, consuming the caller's
    /// reference as the table's. An installed version that already covers
    /// `blob` (same id, or a higher sequence in the same authority epoch)
    /// wins and `blob` is released instead. With `pin` the
    /// winner is acquired for the caller under the same lock.
    fn install(&self, blob: Arc<VersionedBlob>, pin: bool) -> Option<Arc<VersionedBlob>> {
        let path = blob.path().to_string();
        let (pinned, dropped) = {
            let mut entries = lock(&self.inner.entries);
            let stamp = blob.stamp();
            let keep_existing = entries
                .peek(&path)
                .is_some_and(|entry| entry.newest.stamp().covers(&stamp));
            let (newest, dropped) = if keep_existing {
                let newest = entries.get(&path).map(|entry| entry.newest.clone());
                (newest, Some(blob))
            } else {
                let superseded = entries
                    .put(path.clone(), CacheEntry {
                        newest: blob.clone(),
                    })
                    .map(|old| old.newest);
                (Some(blob), superseded)
            };
            let pinned = if pin {
                newest.filter(|newest| newest.acquire())
            } else {
                None
            };
            (pinned, dropped)
        };
        if let Some(dropped) = dropped {
            self.release_detached(dropped);
        }
        pinned
    }

    /// Wrap a pinned blob in a session, cloning it first when writing.
    async fn open_blob(&self, blob: Arc<VersionedBlob>, mode: OpenMode) -> SnapResult<Session> {
        let path = blob.path().to_string();
        let guard = BlobGuard::new(self.clone(), blob);
        let perms = guard.blob().perms();
        if (mode.read && !perms.can_read) || (mode.write && !perms.can_write) {
            guard.release().await?;
            return Err(SnapError::PermissionDenied(path));
        }
        if !mode.write {
            return Session::open_file(&path, guard, false).await;
        }

        let copy = self.clone_for_write(guard.blob()).await;
        guard.release().await?;
        Session::open_file(&path, copy?, true).await
    }

    /// Private copy of `source` under a provisional stamp.
    async fn clone_for_write(&self, source: &VersionedBlob) -> SnapResult<BlobGuard> {
        let path = source.path();
        let size = source.size();
        self.reserve(size).await?;

        let file = self.blob_file(path);
        if let Err(e) = tokio::fs::copy(source.file_path(), &file).await {
            let _ = tokio::fs::remove_file(&file).await;
            self.give_back(size);
            return Err(e.into());
        }
        let copy = VersionedBlob::new(
            path,
            file,
            VersionStamp::provisional(),
            source.perms(),
            size,
            false,
        );
        Ok(BlobGuard::new(self.clone(), Arc::new(copy)))
    }

    /// Empty write blob for a path the authority does not have. It enters
    /// the table only once its session closes and the upload succeeds.
    async fn open_created(&self, path: &str) -> SnapResult<Session> {
        let file = self.blob_file(path);
        File::create(&file).await?;
        let blob = VersionedBlob::new(
            path,
            file,
            VersionStamp::provisional(),
            Perms::READ_WRITE,
            0,
            true,
        );
        debug!(path, "creating new file");
        Session::open_file(path, BlobGuard::new(self.clone(), Arc::new(blob)), true).await
    }

    /// Drop the local entry for `path`. Never writes anything back.
    pub fn remove(&self, path: &str) -> bool {
        let entry = lock(&self.inner.entries).pop(path);
        match entry {
            Some(entry) => {
                debug!(path, "dropping cached entry");
                self.release_detached(entry.newest);
                true
            }
            None => false,
        }
    }

    /// Delete `path` at the authority, then locally.
    pub async fn unlink(&self, path: &str) -> SnapResult<()> {
        let result = self.inner.coherence.remove(path).await;
        if matches!(result, Ok(()) | Err(SnapError::NoSuchFile(_))) {
            self.remove(path);
        }
        result
    }

    /// Move `path` to the most recently used position.
    pub fn touch(&self, path: &str) {
        lock(&self.inner.entries).promote(path);
    }

    /// Claim `size` bytes of the budget, evicting unused entries from the
    /// least recently used end. Waits for sessions to release versions when
    /// nothing is evictable, up to the configured eviction wait.
    pub async fn reserve(&self, size: u64) -> SnapResult<()> {
        if size == 0 {
            return Ok(());
        }
        let capacity = self.inner.capacity;
        let no_space = || SnapError::NoSpace {
            requested: size,
            capacity,
        };
        if size > capacity {
            warn!(size, capacity, "reservation larger than the whole cache");
            return Err(no_space());
        }

        let _gate = self.inner.reserve_gate.lock().await;
        let deadline = Instant::now() + self.inner.eviction_wait;
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.take_space(size) {
                return Ok(());
            }
            match self.evict_for(size) {
                Some(0) => {}
                Some(_) => continue,
                None => {
                    warn!(size, "nothing cached to evict and not enough space");
                    return Err(no_space());
                }
            }
            debug!(size, "all cached versions in use, waiting for a release");
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(size, "timed out waiting for cache space");
                return Err(no_space());
            }
        }
    }

    pub fn give_back(&self, size: u64) {
        if size == 0 {
            return;
        }
        {
            let mut free = lock(&self.inner.free);
            *free = (*free + size).min(self.inner.capacity);
        }
        self.inner.released.notify_waiters();
    }

    fn take_space(&self, size: u64) -> bool {
        let mut free = lock(&self.inner.free);
        if *free >= size {
            *free -= size;
            true
        } else {
            false
        }
    }

    /// Evict unused entries from the cold end until `size` would fit.
    /// Returns how many were evicted, or `None` when the table is empty.
    fn evict_for(&self, size: u64) -> Option<usize> {
        let victims: Vec<Arc<VersionedBlob>> = {
            let mut entries = lock(&self.inner.entries);
            if entries.is_empty() {
                return None;
            }
            let free = *lock(&self.inner.free);
            let mut reclaimed = 0u64;
            let mut chosen = Vec::new();
            for (path, entry) in entries.iter().rev() {
                if free + reclaimed >= size {
                    break;
                }
                // the table's own reference is the only one left
                if entry.newest.ref_count() <= 1 {
                    reclaimed += entry.newest.size();
                    chosen.push(path.clone());
                }
            }
            chosen
                .iter()
                .filter_map(|path| entries.pop(path))
                .map(|entry| entry.newest)
                .collect()
        };
        for blob in &victims {
            debug!(path = blob.path(), size = blob.size(), "evicting");
        }
        let evicted = victims.len();
        for blob in victims {
            self.release_detached(blob);
        }
        Some(evicted)
    }

    /// Settle one released reference in an async context.
    pub(crate) async fn release_blob(&self, blob: Arc<VersionedBlob>) -> SnapResult<()> {
        match blob.release() {
            Released::Retained => {
                self.inner.released.notify_waiters();
                Ok(())
            }
            Released::Discard => {
                self.discard(&blob);
                Ok(())
            }
            Released::Publish => self.publish(blob).await,
        }
    }

    /// Settle one released reference without awaiting. A write-back is
    /// moved onto a spawned task.
    fn release_detached(&self, blob: Arc<VersionedBlob>) {
        match blob.release() {
            Released::Retained => self.inner.released.notify_waiters(),
            Released::Discard => self.discard(&blob),
            Released::Publish => match Handle::try_current() {
                Ok(handle) => {
                    let cache = self.clone();
                    handle.spawn(async move {
                        let path = blob.path().to_string();
                        if let Err(e) = cache.publish(blob).await {
                            error!(%path, "background write-back failed: {e}");
                        }
                    });
                }
                Err(_) => {
                    error!(path = blob.path(), "no runtime to write back modified file, dropping it");
                    if blob.release() == Released::Discard {
                        self.discard(&blob);
                    }
                }
            },
        }
    }

    fn discard(&self, blob: &VersionedBlob) {
        blob.remove_file();
        self.give_back(blob.size());
    }

    /// Upload a modified blob whose last session closed, then install it
    /// as the newest version under the stamp the authority minted.
    async fn publish(&self, blob: Arc<VersionedBlob>) -> SnapResult<()> {
        let path = blob.path().to_string();
        match self.inner.coherence.commit(&path, blob.file_path()).await {
            Ok((stamp, perms)) => {
                blob.adopt(stamp, perms);
                info!(%path, seq = stamp.seq, version = %stamp.id, "published new version");
                self.install(blob, false);
                Ok(())
            }
            Err(e) => {
                error!(%path, "write-back failed, local changes dropped: {e}");
                if blob.release() == Released::Discard {
                    self.discard(&blob);
                }
                Err(e)
            }
        }
    }

    fn blob_file(&self, path: &str) -> PathBuf {
        let name = format!(
            "{}.{}.{BLOB_EXTENSION}",
            path.replace('/', "_"),
            Uuid::new_v4().simple()
        );
        self.inner.dir.join(name)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

/// One session's reference on a blob. Dropping the guard without calling
/// `release` still gives the reference back.
pub struct BlobGuard {
    cache: ClientCache,
    blob: Arc<VersionedBlob>,
    released: bool,
}

impl BlobGuard {
    fn new(cache: ClientCache, blob: Arc<VersionedBlob>) -> Self {
        Self {
            cache,
            blob,
            released: false,
        }
    }

    pub fn blob(&self) -> &Arc<VersionedBlob> {
        &self.blob
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Give the reference back, waiting for a write-back this triggers.
    pub async fn release(mut self) -> SnapResult<()> {
        self.released = true;
        let blob = self.blob.clone();
        self.cache.release_blob(blob).await
    }
}

impl Drop for BlobGuard {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release_detached(self.blob.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::Authority;
    use crate::protocol::{AuthorityRequest, AuthorityResponse};
    use crate::transport::{LocalTransport, Transport, TransportError};
    use crate::types::VersionId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Confirms every check as current, whatever the client has cached.
    #[derive(Default)]
    struct AlwaysCurrent {
        checks: AtomicUsize,
    }

    #[async_trait]
    impl Transport for AlwaysCurrent {
        async fn call(
            &self,
            _request: AuthorityRequest,
        ) -> Result<AuthorityResponse, TransportError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(AuthorityResponse::NoUpdate {
                version: VersionStamp::provisional(),
                perms: Perms::READ_WRITE,
            })
        }
    }

    fn blob_count(tmp: &tempfile::TempDir) -> usize {
        std::fs::read_dir(tmp.path().join("cache")).unwrap().count()
    }

    fn cache_over(
        files: &[(&str, &[u8])],
        capacity: u64,
    ) -> (tempfile::TempDir, Arc<Authority>, ClientCache) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        for (name, data) in files {
            std::fs::write(root.join(name), data).unwrap();
        }
        let authority = Arc::new(Authority::new(&root, 8));
        let coherence = CoherenceClient::new(
            Arc::new(LocalTransport::new(authority.clone())),
            Duration::from_secs(5),
        );
        let mut config = CacheConfig::new(tmp.path().join("cache"), capacity);
        config.eviction_wait_ms = 100;
        let cache = ClientCache::new(&config, coherence).unwrap();
        (tmp, authority, cache)
    }

    #[tokio::test]
    async fn test_startup_purges_leftover_blobs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("cache");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.123.blob"), b"old").unwrap();
        std::fs::write(dir.join("notes.txt"), b"keep").unwrap();

        let authority = Arc::new(Authority::new(tmp.path(), 8));
        let coherence = CoherenceClient::new(
            Arc::new(LocalTransport::new(authority)),
            Duration::from_secs(1),
        );
        ClientCache::new(&CacheConfig::new(&dir, 64), coherence).unwrap();
        assert!(!dir.join("a.123.blob").exists());
        assert!(dir.join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_open_installs_entry_with_table_reference() {
        let (_tmp, _auth, cache) = cache_over(&[("f", b"hello")], 64);
        let session = cache.check_and_open("f", OpenMode::READ).await.unwrap();
        assert!(cache.contains("f"));
        assert_eq!(cache.ref_count("f"), Some(2));
        assert_eq!(cache.free_space(), 59);
        session.close().await.unwrap();
        assert_eq!(cache.ref_count("f"), Some(1));
    }

    #[tokio::test]
    async fn test_reopen_reuses_cached_version() {
        let (_tmp, _auth, cache) = cache_over(&[("f", b"hello")], 64);
        cache.check_and_open("f", OpenMode::READ).await.unwrap().close().await.unwrap();
        let first = cache.newest_version("f").unwrap();
        cache.check_and_open("f", OpenMode::READ).await.unwrap().close().await.unwrap();
        assert_eq!(cache.newest_version("f"), Some(first));
        assert_eq!(cache.free_space(), 59);
    }

    #[tokio::test]
    async fn test_eviction_takes_least_recent_unused_entry() {
        let (_tmp, _auth, cache) =
            cache_over(&[("a", &[1u8; 10]), ("b", &[2u8; 10]), ("c", &[3u8; 10])], 25);
        cache.check_and_open("a", OpenMode::READ).await.unwrap().close().await.unwrap();
        cache.check_and_open("b", OpenMode::READ).await.unwrap().close().await.unwrap();
        cache.touch("a");
        cache.check_and_open("c", OpenMode::READ).await.unwrap().close().await.unwrap();

        assert_eq!(cache.cached_paths(), vec!["c".to_string(), "a".to_string()]);
        assert_eq!(cache.free_space(), 5);
    }

    #[tokio::test]
    async fn test_reserve_beyond_capacity_fails_fast() {
        let (_tmp, _auth, cache) = cache_over(&[], 16);
        let err = cache.reserve(17).await.unwrap_err();
        assert!(matches!(err, SnapError::NoSpace { requested: 17, capacity: 16 }));
        assert_eq!(cache.free_space(), 16);
    }

    #[tokio::test]
    async fn test_reserve_waits_for_release() {
        let (_tmp, _auth, cache) = cache_over(&[("a", &[1u8; 10])], 12);
        let session = cache.check_and_open("a", OpenMode::READ).await.unwrap();

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.reserve(8).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(!cache.contains("a"));
        assert_eq!(cache.free_space(), 4);
    }

    #[tokio::test]
    async fn test_reserve_gives_up_when_everything_is_pinned() {
        let (_tmp, _auth, cache) = cache_over(&[("a", &[1u8; 10])], 12);
        let _session = cache.check_and_open("a", OpenMode::READ).await.unwrap();
        let err = cache.reserve(8).await.unwrap_err();
        assert!(matches!(err, SnapError::NoSpace { .. }));
        assert!(cache.contains("a"));
    }

    #[tokio::test]
    async fn test_remove_discards_without_write_back() {
        let (tmp, _auth, cache) = cache_over(&[("f", b"abc")], 64);
        cache.check_and_open("f", OpenMode::READ).await.unwrap().close().await.unwrap();
        assert!(cache.remove("f"));
        assert!(!cache.remove("f"));
        assert_eq!(cache.free_space(), 64);
        let blobs = std::fs::read_dir(tmp.path().join("cache")).unwrap().count();
        assert_eq!(blobs, 0);
    }

    #[tokio::test]
    async fn test_dropped_session_releases_reference() {
        let (_tmp, _auth, cache) = cache_over(&[("f", b"abc")], 64);
        let session = cache.check_and_open("f", OpenMode::READ).await.unwrap();
        assert_eq!(cache.ref_count("f"), Some(2));
        drop(session);
        assert_eq!(cache.ref_count("f"), Some(1));
    }

    #[tokio::test]
    async fn test_older_fetch_loses_to_installed_version() {
        let (tmp, _auth, cache) = cache_over(&[("f", b"hello")], 64);
        let mut session = cache
            .check_and_open("f", OpenMode::from(crate::OpenOption::Write))
            .await
            .unwrap();
        session.write(b"HELLO").await.unwrap();
        session.close().await.unwrap();
        let installed = cache.newest_version("f").unwrap();
        assert_eq!(cache.free_space(), 59);

        let older = Download {
            version: VersionStamp::new(VersionId::fresh(), installed.epoch, installed.seq - 1),
            perms: Perms::READ_WRITE,
            size: 5,
            first_chunk: b"hello".to_vec(),
            transfer: None,
        };
        let winner = cache.fetch("f", older).await.unwrap();
        assert_eq!(winner.stamp(), installed);
        assert_eq!(cache.newest_version("f"), Some(installed));
        assert_eq!(cache.free_space(), 59);
        assert_eq!(blob_count(&tmp), 1);

        let mut session = cache.open_blob(winner, OpenMode::READ).await.unwrap();
        assert_eq!(session.read(16).await.unwrap(), b"HELLO");
        session.close().await.unwrap();
        assert_eq!(cache.ref_count("f"), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_cold_opens_install_one_entry() {
        let (tmp, _auth, cache) = cache_over(&[("f", &[7u8; 20])], 64);
        let (a, b) = tokio::join!(
            cache.check_and_open("f", OpenMode::READ),
            cache.check_and_open("f", OpenMode::READ)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.version(), b.version());
        assert_eq!(cache.cached_paths(), vec!["f".to_string()]);
        assert_eq!(cache.ref_count("f"), Some(3));
        assert_eq!(cache.free_space(), 44);

        a.close().await.unwrap();
        b.close().await.unwrap();
        assert_eq!(cache.ref_count("f"), Some(1));
        assert_eq!(cache.free_space(), 44);
        assert_eq!(blob_count(&tmp), 1);
    }

    #[tokio::test]
    async fn test_persistently_stale_open_is_not_reported_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let transport = Arc::new(AlwaysCurrent::default());
        let coherence = CoherenceClient::new(transport.clone(), Duration::from_secs(1));
        let cache = ClientCache::new(&CacheConfig::new(tmp.path(), 64), coherence).unwrap();

        // the authority says the cached copy is current but there is none
        let err = cache.check_and_open("f", OpenMode::READ).await.unwrap_err();
        assert!(matches!(err, SnapError::Stale(_)));
        assert_eq!(err.status(), crate::StatusCode::IoError);
        assert_eq!(transport.checks.load(Ordering::SeqCst), OPEN_ATTEMPTS as usize);
    }
}
