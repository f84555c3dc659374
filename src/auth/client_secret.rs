//! Client secret credential
//!
//! OAuth2 client-credentials grant against the identity platform v2 token
//! endpoint. Configuration normally comes from the environment.

use super::{AccessToken, TokenCredential, TokenRequest};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::http::transport::sanitize_for_log;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use url::Url;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Assumed lifetime when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_TTL_SECS: i64 = 60 * 60;

#[derive(Clone)]
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    authority: Url,
    client: Client,
}

impl fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("authority", &self.authority.as_str())
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Validate a tenant ID before it becomes part of a URL path
/// Accepts GUIDs and domain names: alphanumerics, hyphens and dots
fn validate_tenant_id(tenant: &str) -> bool {
    !tenant.is_empty()
        && tenant.len() <= 256
        && tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        authority: Url,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        if !validate_tenant_id(&tenant_id) {
            return Err(Error::Credential {
                message: format!("invalid tenant ID {tenant_id:?}"),
            });
        }

        let client = Client::builder()
            .user_agent(concat!("armcore/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            tenant_id,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authority,
            client,
        })
    }

    /// Build from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`
    /// and the optional `AZURE_AUTHORITY_HOST`
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Credential {
                    message: format!("environment variable {name} is not set"),
                })
        };

        let authority = match std::env::var("AZURE_AUTHORITY_HOST") {
            Ok(host) if !host.trim().is_empty() => Url::parse(host.trim())?,
            _ => Url::parse(DEFAULT_AUTHORITY_HOST)?,
        };

        Self::new(
            var("AZURE_TENANT_ID")?,
            var("AZURE_CLIENT_ID")?,
            var("AZURE_CLIENT_SECRET")?,
            authority,
        )
    }

    fn token_url(&self, tenant: &str) -> Result<Url> {
        if !validate_tenant_id(tenant) {
            return Err(Error::Credential {
                message: format!("invalid tenant ID {tenant:?}"),
            });
        }
        Ok(self.authority.join(&format!("{tenant}/oauth2/v2.0/token"))?)
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, ctx: &Context, request: &TokenRequest) -> Result<AccessToken> {
        let tenant = request.tenant_id.as_deref().unwrap_or(&self.tenant_id);
        let url = self.token_url(tenant)?;
        let scope = request.scopes.join(" ");

        tracing::debug!("POST {} (client {})", url, self.client_id);

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];
        if let Some(claims) = &request.claims {
            form.push(("claims", claims.as_str()));
        }
        let response = ctx
            .run(async {
                self.client
                    .post(url.clone())
                    .form(&form)
                    .send()
                    .await
                    .map_err(Error::from)
            })
            .await?;

        let status = response.status();
        let body = ctx
            .run(async move { response.text().await.map_err(Error::from) })
            .await?;

        if !status.is_success() {
            return Err(Error::Credential {
                message: format!(
                    "ClientSecretCredential authentication failed for tenant {}: {} - {}",
                    tenant,
                    status,
                    sanitize_for_log(&body)
                ),
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| Error::Credential {
            message: format!("malformed token response: {e}"),
        })?;
        let lifetime = parsed.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        Ok(AccessToken {
            token: parsed.access_token,
            expires_on: Utc::now() + chrono::Duration::seconds(lifetime),
        })
    }
}
