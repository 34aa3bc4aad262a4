//! Shared value types: version identity, permission bits, status codes and
//! the open/seek options accepted by the file-call front end.

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one committed state of a file at the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId(Uuid);

impl VersionId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One run of the authority process. Sequence numbers restart with every
/// run, so they only order stamps minted within the same epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch(Uuid);

impl Epoch {
    /// Epoch of stamps that were never committed.
    pub const UNCOMMITTED: Epoch = Epoch(Uuid::nil());

    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A version id together with the commit sequence number at which the
/// authority minted it. Within one epoch `seq` only ever grows, so a client
/// can tell which of two versions of the same path is newer without
/// interpreting `id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStamp {
    pub id: VersionId,
    pub epoch: Epoch,
    pub seq: u64,
}

impl VersionStamp {
    pub fn new(id: VersionId, epoch: Epoch, seq: u64) -> Self {
        Self { id, epoch, seq }
    }

    /// Stamp for a blob that has never been committed (fresh files and
    /// private write copies).
    pub fn provisional() -> Self {
        Self::new(VersionId::fresh(), Epoch::UNCOMMITTED, 0)
    }

    /// True when `other` is known to be this version or an older one.
    /// Stamps from different epochs are unordered, so this is false for
    /// them and the caller takes the authority's latest answer.
    pub fn covers(&self, other: &VersionStamp) -> bool {
        self.id == other.id || (self.epoch == other.epoch && self.seq >= other.seq)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms {
    pub can_read: bool,
    pub can_write: bool,
}

impl Perms {
    pub const READ_WRITE: Perms = Perms {
        can_read: true,
        can_write: true,
    };

    pub fn new(can_read: bool, can_write: bool) -> Self {
        Self {
            can_read,
            can_write,
        }
    }
}

/// Caller-visible result of a file call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    NoSuchFile,
    AlreadyExists,
    PermissionDenied,
    IsADirectory,
    NotADirectory,
    BadHandle,
    TooManyOpenFiles,
    InvalidArgument,
    NoSpace,
    IoError,
}

impl StatusCode {
    /// Negative POSIX errno, 0 for `Ok`.
    pub fn errno(self) -> i32 {
        let errno = match self {
            StatusCode::Ok => return 0,
            StatusCode::NoSuchFile => Errno::ENOENT,
            StatusCode::AlreadyExists => Errno::EEXIST,
            StatusCode::PermissionDenied => Errno::EACCES,
            StatusCode::IsADirectory => Errno::EISDIR,
            StatusCode::NotADirectory => Errno::ENOTDIR,
            StatusCode::BadHandle => Errno::EBADF,
            StatusCode::TooManyOpenFiles => Errno::EMFILE,
            StatusCode::InvalidArgument => Errno::EINVAL,
            StatusCode::NoSpace => Errno::ENOSPC,
            StatusCode::IoError => Errno::EIO,
        };
        -(errno as i32)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Open option as issued by a client program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOption {
    /// Open an existing file read-only.
    Read,
    /// Open an existing file for reading and writing.
    Write,
    /// Open for reading and writing, creating the file if missing.
    Create,
    /// Create a new file; fails if the path already resolves.
    CreateNew,
}

/// Access requested from the cache for one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        read: true,
        write: false,
        create: false,
        exclusive: false,
    };

    /// Wants anything beyond plain reading (rejected on directories).
    pub fn mutates(&self) -> bool {
        self.write || self.create || self.exclusive
    }
}

impl From<OpenOption> for OpenMode {
    fn from(option: OpenOption) -> Self {
        OpenMode {
            read: true,
            write: option != OpenOption::Read,
            create: matches!(option, OpenOption::Create | OpenOption::CreateNew),
            exclusive: option == OpenOption::CreateNew,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}
