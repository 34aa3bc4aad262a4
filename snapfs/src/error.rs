use crate::transport::TransportError;
use crate::types::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapError {
    #[error("no such file: {0}")]
    NoSuchFile(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("bad file handle: {0}")]
    BadHandle(i32),

    #[error("too many open files")]
    TooManyOpenFiles,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cache space exhausted: requested {requested} bytes, capacity {capacity} bytes")]
    NoSpace { requested: u64, capacity: u64 },

    /// The cached version vanished between lookup and use. Opens retry a
    /// few times before this surfaces; the file may well still exist.
    #[error("cached version of {0} went stale")]
    Stale(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SnapResult<T> = Result<T, SnapError>;

impl SnapError {
    pub fn status(&self) -> StatusCode {
        match self {
            SnapError::NoSuchFile(_) => StatusCode::NoSuchFile,
            SnapError::AlreadyExists(_) => StatusCode::AlreadyExists,
            SnapError::PermissionDenied(_) => StatusCode::PermissionDenied,
            SnapError::IsADirectory(_) => StatusCode::IsADirectory,
            SnapError::NotADirectory(_) => StatusCode::NotADirectory,
            SnapError::BadHandle(_) => StatusCode::BadHandle,
            SnapError::TooManyOpenFiles => StatusCode::TooManyOpenFiles,
            SnapError::InvalidArgument(_) => StatusCode::InvalidArgument,
            SnapError::NoSpace { .. } => StatusCode::NoSpace,
            SnapError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                StatusCode::PermissionDenied
            }
            SnapError::Stale(_)
            | SnapError::Transport(_)
            | SnapError::Protocol(_)
            | SnapError::Io(_) => {
                StatusCode::IoError
            }
        }
    }

    /// Rebuild an error from a status code reported by the authority.
    pub fn from_status(code: StatusCode, path: &str) -> Self {
        let path = path.to_string();
        match code {
            StatusCode::NoSuchFile => SnapError::NoSuchFile(path),
            StatusCode::AlreadyExists => SnapError::AlreadyExists(path),
            StatusCode::PermissionDenied => SnapError::PermissionDenied(path),
            StatusCode::IsADirectory => SnapError::IsADirectory(path),
            StatusCode::NotADirectory => SnapError::NotADirectory(path),
            StatusCode::InvalidArgument => SnapError::InvalidArgument(path),
            StatusCode::TooManyOpenFiles => SnapError::TooManyOpenFiles,
            // client-side conditions the authority never reports
            StatusCode::BadHandle | StatusCode::NoSpace => {
                SnapError::Protocol(format!("authority reported {code} for {path}"))
            }
            StatusCode::IoError => {
                SnapError::Io(std::io::Error::other(format!("authority i/o error on {path}")))
            }
            StatusCode::Ok => SnapError::Protocol(format!("error reply carried OK for {path}")),
        }
    }

    /// Caller-visible negative errno for this failure.
    pub fn errno(&self) -> i32 {
        self.status().errno()
    }
}
