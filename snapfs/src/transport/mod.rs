//! Remote invocation boundary between a client cache and the authority.
//!
//! Submodules:
//! - `local`: in-process binding that calls an `Authority` directly
//! - `quic`: QUIC binding, one bidirectional stream per call, bincode framing
pub mod local;
pub mod quic;

use crate::protocol::{AuthorityRequest, AuthorityResponse};
use async_trait::async_trait;
use std::time::Duration;

pub use local::LocalTransport;
pub use quic::QuicTransport;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<bincode::Error> for TransportError {
    fn from(e: bincode::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: AuthorityRequest) -> Result<AuthorityResponse, TransportError>;
}
