//! One on-disk copy of a file at one version.
//!
//! The reference count covers every holder: the path table keeps one
//! reference on the newest blob of each entry and each open session keeps
//! one on the blob it reads or writes. When the count reaches zero the blob
//! makes its terminal decision exactly once: a clean blob is deleted, a
//! dirty one is handed back for publishing first.

use crate::types::{Perms, VersionStamp};
use crate::util::lock;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// What the caller of `release` must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
    /// Other holders remain.
    Retained,
    /// Last reference gone: delete the bytes and return the space.
    Discard,
    /// Last reference gone on a modified blob. The caller now owns a single
    /// publishing reference and must upload the bytes, then either install
    /// the blob as the entry's newest version or release it again.
    Publish,
}

#[derive(Debug)]
struct BlobState {
    stamp: VersionStamp,
    perms: Perms,
    ref_count: u32,
    size: u64,
    dirty: bool,
    deleted: bool,
}

#[derive(Debug)]
pub struct VersionedBlob {
    path: String,
    file: PathBuf,
    state: Mutex<BlobState>,
}

impl VersionedBlob {
    /// A blob starts with one reference owned by its creator.
    pub fn new(
        path: impl Into<String>,
        file: PathBuf,
        stamp: VersionStamp,
        perms: Perms,
        size: u64,
        dirty: bool,
    ) -> Self {
        Self {
            path: path.into(),
            file,
            state: Mutex::new(BlobState {
                stamp,
                perms,
                ref_count: 1,
                size,
                dirty,
                deleted: false,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn file_path(&self) -> &Path {
        &self.file
    }

    pub fn stamp(&self) -> VersionStamp {
        lock(&self.state).stamp
    }

    pub fn perms(&self) -> Perms {
        lock(&self.state).perms
    }

    pub fn size(&self) -> u64 {
        lock(&self.state).size
    }

    pub fn ref_count(&self) -> u32 {
        lock(&self.state).ref_count
    }

    pub fn is_dirty(&self) -> bool {
        lock(&self.state).dirty
    }

    pub fn is_deleted(&self) -> bool {
        lock(&self.state).deleted
    }

    /// Take another reference. Fails once the blob is deleted; the caller
    /// must then look the path up again.
    pub fn acquire(&self) -> bool {
        let mut state = lock(&self.state);
        if state.deleted {
            return false;
        }
        state.ref_count += 1;
        true
    }

    pub fn release(&self) -> Released {
        let mut state = lock(&self.state);
        if state.deleted || state.ref_count == 0 {
            warn!(path = %self.path, "release of a blob with no references");
            return Released::Retained;
        }
        state.ref_count -= 1;
        if state.ref_count > 0 {
            return Released::Retained;
        }
        if state.dirty {
            state.dirty = false;
            state.ref_count = 1;
            return Released::Publish;
        }
        state.deleted = true;
        Released::Discard
    }

    /// Bytes beyond the current size a write ending at `end` needs.
    pub fn growth_needed(&self, end: u64) -> u64 {
        end.saturating_sub(lock(&self.state).size)
    }

    /// Note a completed write ending at `end`. Space for any growth must
    /// already be reserved. Shrinking is never recorded.
    pub fn record_write(&self, end: u64) {
        let mut state = lock(&self.state);
        state.size = state.size.max(end);
        state.dirty = true;
    }

    /// Take on the identity the authority assigned to the published bytes.
    pub fn adopt(&self, stamp: VersionStamp, perms: Perms) {
        let mut state = lock(&self.state);
        state.stamp = stamp;
        state.perms = perms;
    }

    pub fn set_perms(&self, perms: Perms) {
        lock(&self.state).perms = perms;
    }

    /// Delete the backing file. Only valid after `Released::Discard`.
    pub(crate) fn remove_file(&self) {
        match std::fs::remove_file(&self.file) {
            Ok(()) => debug!(path = %self.path, file = %self.file.display(), "blob discarded"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path, "failed to delete {}: {e}", self.file.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Epoch, VersionId};

    fn blob(dirty: bool) -> VersionedBlob {
        VersionedBlob::new(
            "a",
            PathBuf::from("/nonexistent/a.blob"),
            VersionStamp::provisional(),
            Perms::READ_WRITE,
            4,
            dirty,
        )
    }

    #[test]
    fn test_clean_blob_discards_once() {
        let b = blob(false);
        assert!(b.acquire());
        assert_eq!(b.ref_count(), 2);
        assert_eq!(b.release(), Released::Retained);
        assert_eq!(b.release(), Released::Discard);
        assert!(b.is_deleted());
        assert_eq!(b.ref_count(), 0);

        // further releases never underflow or repeat the terminal step
        assert_eq!(b.release(), Released::Retained);
        assert_eq!(b.ref_count(), 0);
        assert!(!b.acquire());
    }

    #[test]
    fn test_dirty_blob_asks_for_publish_then_discards() {
        let b = blob(false);
        b.record_write(10);
        assert!(b.is_dirty());
        assert_eq!(b.size(), 10);

        assert_eq!(b.release(), Released::Publish);
        assert_eq!(b.ref_count(), 1);
        assert!(!b.is_dirty());
        assert!(!b.is_deleted());

        assert_eq!(b.release(), Released::Discard);
        assert!(b.is_deleted());
    }

    #[test]
    fn test_growth_is_tracked_but_never_shrinks() {
        let b = blob(false);
        assert_eq!(b.growth_needed(3), 0);
        assert_eq!(b.growth_needed(9), 5);
        b.record_write(9);
        b.record_write(2);
        assert_eq!(b.size(), 9);
    }

    #[test]
    fn test_adopt_replaces_identity() {
        let b = blob(true);
        let stamp = VersionStamp::new(VersionId::fresh(), Epoch::fresh(), 42);
        b.adopt(stamp, Perms::new(true, false));
        assert_eq!(b.stamp(), stamp);
        assert!(!b.perms().can_write);
    }
}
