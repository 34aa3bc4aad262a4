//! In-process binding: hands requests straight to an `Authority`.

use super::{Transport, TransportError};
use crate::authority::Authority;
use crate::protocol::{AuthorityRequest, AuthorityResponse};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Clone)]
pub struct LocalTransport {
    authority: Arc<Authority>,
}

impl LocalTransport {
    pub fn new(authority: Arc<Authority>) -> Self {
        Self { authority }
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, request: AuthorityRequest) -> Result<AuthorityResponse, TransportError> {
        Ok(self.authority.handle(request).await)
    }
}
