//! snapfs: a whole-file client cache with AFS-style session semantics.
//!
//! A client opens a file and works on a private, consistent snapshot of it;
//! changes reach the authority (and become visible to other clients) only
//! when the last session holding the modified copy closes. Local bytes are
//! bounded by a byte budget enforced with LRU eviction that never touches
//! versions still in use.
//!
//! Modules:
//! - `cache`: versioned blobs, the path table with its LRU order, space accounting
//! - `authority`: the file-of-record side (version table, transfers)
//! - `protocol`: wire messages and the client half of the coherence protocol
//! - `transport`: bindings that carry protocol calls (in-process, QUIC)
//! - `fs`: handle table and file-call front end used by the proxy

pub mod authority;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod path;
pub mod protocol;
pub mod transport;
pub mod types;
mod util;

pub use error::{SnapError, SnapResult};
pub use types::{Epoch, OpenMode, OpenOption, Perms, StatusCode, VersionId, VersionStamp, Whence};
