//! Version table of the authority.
//!
//! Responsibilities:
//! - map canonical paths to their current version stamp and permission bits
//! - serialize every operation on one path behind that path's own lock
//! - mint a fresh stamp on each publish
//!
//! Records are created lazily the first time an existing backing file is
//! resolved. Lock slots for paths that turn out not to exist are dropped as
//! soon as nobody else waits on them.

use crate::error::SnapResult;
use crate::types::{Epoch, Perms, VersionId, VersionStamp};
use crate::util::lock;
use nix::unistd::{AccessFlags, access};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub version: VersionStamp,
    pub perms: Perms,
}

type Slot = Arc<AsyncMutex<Option<FileRecord>>>;

pub struct AuthorityFileTable {
    root: PathBuf,
    slots: Mutex<HashMap<String, Slot>>,
    epoch: Epoch,
    // commit sequence shared by all paths, restarts with every epoch
    seq: AtomicU64,
}

impl AuthorityFileTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            slots: Mutex::new(HashMap::new()),
            epoch: Epoch::fresh(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backing_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    /// Enter the critical section for `path`. Unrelated paths never contend.
    pub async fn lock_path(&self, path: &str) -> PathGuard<'_> {
        let slot = lock(&self.slots)
            .entry(path.to_string())
            .or_default()
            .clone();
        PathGuard {
            table: self,
            path: path.to_string(),
            record: slot.lock_owned().await,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Number of paths currently holding a lock slot.
    pub fn tracked(&self) -> usize {
        lock(&self.slots).len()
    }

    fn next_stamp(&self) -> VersionStamp {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        VersionStamp::new(VersionId::fresh(), self.epoch, seq)
    }
}

fn perms_of(backing: &Path) -> Perms {
    Perms::new(
        access(backing, AccessFlags::R_OK).is_ok(),
        access(backing, AccessFlags::W_OK).is_ok(),
    )
}

/// Exclusive hold on one path's record.
pub struct PathGuard<'a> {
    table: &'a AuthorityFileTable,
    path: String,
    record: OwnedMutexGuard<Option<FileRecord>>,
}

impl PathGuard<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn backing(&self) -> PathBuf {
        self.table.backing_path(&self.path)
    }

    /// Current record, reconciled with the backing file. A file that exists
    /// but was never seen gets a record with a fresh stamp; a record whose
    /// file disappeared is dropped.
    pub fn resolve(&mut self) -> SnapResult<Option<FileRecord>> {
        let backing = self.backing();
        match std::fs::metadata(&backing) {
            Ok(meta) if meta.is_file() => {
                let perms = perms_of(&backing);
                let record = match *self.record {
                    Some(mut existing) => {
                        existing.perms = perms;
                        existing
                    }
                    None => {
                        let record = FileRecord {
                            version: self.table.next_stamp(),
                            perms,
                        };
                        debug!(path = %self.path, seq = record.version.seq, "tracking file");
                        record
                    }
                };
                *self.record = Some(record);
                Ok(Some(record))
            }
            Ok(_) => {
                *self.record = None;
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                *self.record = None;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the backing file with `temp` and mint a new stamp.
    pub fn publish(&mut self, temp: &Path) -> SnapResult<FileRecord> {
        let backing = self.backing();
        std::fs::rename(temp, &backing)?;
        let record = FileRecord {
            version: self.table.next_stamp(),
            perms: perms_of(&backing),
        };
        *self.record = Some(record);
        Ok(record)
    }

    pub fn remove(&mut self) -> SnapResult<()> {
        match std::fs::remove_file(self.backing()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *self.record = None;
        Ok(())
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        if self.record.is_some() {
            return;
        }
        // the map and this guard are the only holders: nobody is waiting
        let mut slots = lock(&self.table.slots);
        let idle = slots.get(&self.path).is_some_and(|slot| {
            Arc::ptr_eq(slot, OwnedMutexGuard::mutex(&self.record)) && Arc::strong_count(slot) == 2
        });
        if idle {
            slots.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_tracks_existing_file_once() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"x").unwrap();
        let table = AuthorityFileTable::new(tmp.path());

        let first = table.lock_path("a").await.resolve().unwrap().unwrap();
        let second = table.lock_path("a").await.resolve().unwrap().unwrap();
        assert_eq!(first.version, second.version);
        assert_eq!(table.tracked(), 1);
    }

    #[tokio::test]
    async fn test_publish_mints_newer_stamp() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"old").unwrap();
        let table = AuthorityFileTable::new(tmp.path());

        let mut guard = table.lock_path("a").await;
        let before = guard.resolve().unwrap().unwrap();
        let temp = tmp.path().join("a.tmp");
        std::fs::write(&temp, b"new").unwrap();
        let after = guard.publish(&temp).unwrap();
        drop(guard);

        assert_ne!(before.version.id, after.version.id);
        assert!(after.version.seq > before.version.seq);
        assert_eq!(std::fs::read(tmp.path().join("a")).unwrap(), b"new");
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_each_table_mints_in_its_own_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"x").unwrap();
        let first = AuthorityFileTable::new(tmp.path());
        let second = AuthorityFileTable::new(tmp.path());
        assert_ne!(first.epoch(), second.epoch());

        let a = first.lock_path("a").await.resolve().unwrap().unwrap();
        let b = second.lock_path("a").await.resolve().unwrap().unwrap();
        assert_eq!(a.version.epoch, first.epoch());
        assert_eq!(b.version.epoch, second.epoch());
        assert_eq!(a.version.seq, b.version.seq);
        assert!(!a.version.covers(&b.version));
    }

    #[tokio::test]
    async fn test_slots_for_missing_paths_are_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"x").unwrap();
        let table = AuthorityFileTable::new(tmp.path());

        assert!(table.lock_path("nope").await.resolve().unwrap().is_none());
        assert_eq!(table.tracked(), 0);

        let mut guard = table.lock_path("a").await;
        guard.resolve().unwrap();
        guard.remove().unwrap();
        drop(guard);
        assert_eq!(table.tracked(), 0);
        assert!(!tmp.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_externally_deleted_file_drops_record() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"x").unwrap();
        let table = AuthorityFileTable::new(tmp.path());

        table.lock_path("a").await.resolve().unwrap();
        std::fs::remove_file(tmp.path().join("a")).unwrap();
        assert!(table.lock_path("a").await.resolve().unwrap().is_none());
        assert_eq!(table.tracked(), 0);
    }
}
