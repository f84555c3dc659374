//! HTTP request/response model
//!
//! Requests and responses are plain owned values: bodies are fully buffered,
//! so a [`Request`] can be cloned to replay it and a [`Response`] can be kept
//! around by a poller after the connection is gone.
//!
//! # Module Structure
//!
//! - [`pipeline`] - the [`Policy`] trait and the ordered [`Pipeline`]
//! - [`transport`] - the reqwest-backed terminal policy
//! - [`retry`] - retries for throttling and transient server errors

pub mod pipeline;
pub mod retry;
pub mod transport;

pub use pipeline::{send_next, Pipeline, Policy, RequestIdPolicy};
pub use retry::{RetryOptions, RetryPolicy};
pub use transport::HttpTransport;

use crate::error::{Error, Result};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
pub use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use url::Url;

pub const HEADER_AZURE_ASYNC_OPERATION: &str = "azure-asyncoperation";
pub const HEADER_LOCATION: &str = "location";
pub const HEADER_RETRY_AFTER: &str = "retry-after";
pub const HEADER_RETRY_AFTER_MS: &str = "retry-after-ms";
pub const HEADER_X_MS_RETRY_AFTER_MS: &str = "x-ms-retry-after-ms";
pub const HEADER_ERROR_CODE: &str = "x-ms-error-code";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_AUXILIARY_AUTHORIZATION: &str = "x-ms-authorization-auxiliary";
pub const HEADER_CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
pub const HEADER_WWW_AUTHENTICATE: &str = "www-authenticate";

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Serializes `value` as the JSON body.
    pub fn with_json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.with_json_body(body))
    }

    /// Uses already-encoded JSON as the body.
    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn insert_header(&mut self, name: &'static str, value: &str) -> Result<()> {
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Protocol(format!("invalid value for header {name}")))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(())
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

/// A buffered response, tagged with the method and URL of the request that
/// produced it.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    method: Method,
    url: Url,
}

impl Response {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Vec<u8>>,
        method: Method,
        url: Url,
    ) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            method,
            url,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value as a string; empty or non-ASCII values count as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Method of the request that produced this response.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// URL of the request that produced this response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Server-requested delay before the next request.
///
/// `retry-after-ms` and `x-ms-retry-after-ms` take precedence over
/// `Retry-After`, which may be delta-seconds or an HTTP date. A zero or
/// past delay counts as no delay.
pub fn retry_after(response: &Response) -> Option<Duration> {
    for name in [HEADER_RETRY_AFTER_MS, HEADER_X_MS_RETRY_AFTER_MS] {
        if let Some(ms) = response.header(name).and_then(|v| v.parse::<u64>().ok()) {
            return Some(Duration::from_millis(ms)).filter(|d| !d.is_zero());
        }
    }

    let value = response.header(HEADER_RETRY_AFTER)?;
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs)).filter(|d| !d.is_zero());
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&Utc) - Utc::now())
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(headers: &[(&'static str, &str)]) -> Response {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        Response::new(
            StatusCode::ACCEPTED,
            map,
            Vec::new(),
            Method::GET,
            Url::parse("https://management.example.com/op").unwrap(),
        )
    }

    #[test]
    fn test_retry_after_seconds() {
        let resp = response_with(&[(HEADER_RETRY_AFTER, "3")]);
        assert_eq!(retry_after(&resp), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_retry_after_ms_takes_precedence() {
        let resp = response_with(&[(HEADER_RETRY_AFTER, "3"), (HEADER_RETRY_AFTER_MS, "250")]);
        assert_eq!(retry_after(&resp), Some(Duration::from_millis(250)));

        let resp = response_with(&[(HEADER_X_MS_RETRY_AFTER_MS, "40")]);
        assert_eq!(retry_after(&resp), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_retry_after_http_date() {
        let at = Utc::now() + chrono::Duration::seconds(120);
        let value = at.to_rfc2822();
        let resp = response_with(&[(HEADER_RETRY_AFTER, &value)]);
        let delay = retry_after(&resp).expect("date in the future");
        assert!(delay > Duration::from_secs(100) && delay <= Duration::from_secs(120));

        let resp = response_with(&[(HEADER_RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT")]);
        assert_eq!(retry_after(&resp), None);
    }

    #[test]
    fn test_retry_after_absent_or_zero() {
        assert_eq!(retry_after(&response_with(&[])), None);
        assert_eq!(retry_after(&response_with(&[(HEADER_RETRY_AFTER, "0")])), None);
        assert_eq!(retry_after(&response_with(&[(HEADER_RETRY_AFTER, "soon")])), None);
    }

    #[test]
    fn test_empty_header_is_absent() {
        let resp = response_with(&[(HEADER_LOCATION, "")]);
        assert_eq!(resp.header(HEADER_LOCATION), None);
    }

    #[test]
    fn test_request_json_body() {
        let url = Url::parse("https://management.example.com/widgets/1").unwrap();
        let request = Request::new(Method::PUT, url)
            .with_json(&serde_json::json!({"name": "w"}))
            .unwrap();
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.body(), Some(br#"{"name":"w"}"#.as_slice()));
    }
}
