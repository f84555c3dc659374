//! HTTP transport
//!
//! The terminal pipeline policy: turns a [`Request`] into a reqwest call and
//! buffers the response.

use super::{Policy, Request, Response};
use crate::context::Context;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Sanitize response body for logging
/// Truncates long responses and drops control characters
pub(crate) fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.chars().count() > MAX_LOG_BODY_LENGTH {
        let head: String = body.chars().take(MAX_LOG_BODY_LENGTH).collect();
        format!("{}... [truncated, {} bytes total]", head, body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// reqwest-backed transport
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with the crate's user agent
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("armcore/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    /// Wrap an already configured client (proxies, timeouts, ...)
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Policy for HttpTransport {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        _next: &[Arc<dyn Policy>],
    ) -> Result<Response> {
        tracing::debug!("{} {}", request.method(), request.url());

        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone());
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = ctx
            .run(async { builder.send().await.map_err(Error::from) })
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = ctx
            .run(async move { response.bytes().await.map_err(Error::from) })
            .await?;

        if !status.is_success() {
            // Only log sanitized/truncated error bodies
            tracing::debug!(
                "{} {} returned {} - {}",
                request.method(),
                request.url(),
                status,
                sanitize_for_log(&String::from_utf8_lossy(&body))
            );
        }

        Ok(Response::new(
            status,
            headers,
            body.to_vec(),
            request.method().clone(),
            request.url().clone(),
        ))
    }
}
