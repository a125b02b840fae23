//! Caller identity resolution.
//!
//! Authentication itself lives outside this service; a request carries a
//! bearer token that an [`IdentityProvider`] maps to a stable user id.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderValue;
use tradeqr_core::types::UserId;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Map a bearer token to the caller's user id, or `None` if unknown.
    async fn resolve(&self, token: &str) -> Option<UserId>;
}

/// Fixed token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIdentity {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenIdentity {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenIdentity {
    async fn resolve(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).cloned()
    }
}

pub fn extract_bearer_token(header: Option<&HeaderValue>) -> Option<&str> {
    let header = header?;
    let header_str = header.to_str().ok()?;
    header_str
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
