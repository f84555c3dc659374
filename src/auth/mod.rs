//! Authentication
//!
//! Credentials produce access tokens; [`BearerTokenPolicy`] caches them and
//! stamps every outgoing request.

mod bearer;
mod client_secret;

pub use bearer::{BearerTokenOptions, BearerTokenPolicy};
pub use client_secret::ClientSecretCredential;

use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use url::Url;

/// A bearer token and the instant it stops being accepted.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// What to request a token for. `tenant_id` overrides the credential's home
/// tenant (used for auxiliary tenants).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequest {
    pub scopes: Vec<String>,
    pub tenant_id: Option<String>,
    /// Decoded claims from a service's claims challenge, as a JSON string
    pub claims: Option<String>,
}

#[async_trait]
pub trait TokenCredential: Send + Sync + fmt::Debug {
    async fn get_token(&self, ctx: &Context, request: &TokenRequest) -> Result<AccessToken>;
}

/// The `.default` scope for a resource-manager endpoint, e.g.
/// `https://management.azure.com//.default`.
pub fn default_scope(endpoint: &Url) -> String {
    let origin = endpoint.origin().ascii_serialization();
    format!("{origin}//.default")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scope_uses_origin() {
        let endpoint = Url::parse("https://management.azure.com/some/path?x=1").unwrap();
        assert_eq!(default_scope(&endpoint), "https://management.azure.com//.default");
    }

    #[test]
    fn test_access_token_debug_is_redacted() {
        let token = AccessToken {
            token: "secret-value".to_string(),
            expires_on: Utc::now(),
        };
        assert!(!format!("{token:?}").contains("secret-value"));
    }
}
