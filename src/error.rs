//! Error types
//!
//! One error enum for the whole crate. The variants follow the failure classes
//! the pipeline distinguishes: transport, wire-protocol violations, service
//! errors, credential failures, cancellation and provider registration.

use crate::http::{Response, HEADER_ERROR_CODE};
use crate::http::retry::is_retriable_status;
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service broke the resource-manager wire contract.
    #[error("{0}")]
    Protocol(String),

    /// The service answered with an error status.
    #[error(transparent)]
    Response(Box<ResponseError>),

    /// Acquiring a token failed. Never retried.
    #[error("{message}")]
    Credential { message: String },

    #[error("token credentials require a URL using the HTTPS protocol scheme")]
    InsecureTransport,

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    ResumeToken(String),

    /// Registering a resource provider failed. `response` is the conflict
    /// that triggered the registration.
    #[error("failed to register resource provider: {source}")]
    Registration {
        response: Box<Response>,
        source: Box<Error>,
    },

    #[error("exceeded attempts to register {namespace}")]
    RegistrationAttemptsExceeded {
        namespace: String,
        response: Box<Response>,
    },
}

impl Error {
    /// Whether sending the same request again could succeed.
    ///
    /// Only service responses with a throttling or server-side status qualify;
    /// transport, credential and protocol failures are final.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Response(err) => is_retriable_status(err.status),
            _ => false,
        }
    }

    /// The HTTP response attached to this error, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Response(err) => Some(&err.response),
            Error::Registration { response, .. }
            | Error::RegistrationAttemptsExceeded { response, .. } => Some(response),
            _ => None,
        }
    }
}

impl From<ResponseError> for Error {
    fn from(err: ResponseError) -> Self {
        Error::Response(Box::new(err))
    }
}

/// One entry of the `details` array of a service error body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ServiceError>,
}

#[derive(Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

/// A non-success response from the service.
///
/// Built from the `x-ms-error-code` header and the
/// `{ "error": { "code", "message", "details" } }` body shape. Bodies that
/// don't follow that shape still produce a `ResponseError`, just without a
/// code or message.
#[derive(Debug, Clone)]
pub struct ResponseError {
    pub status: StatusCode,
    pub error_code: Option<String>,
    pub message: Option<String>,
    pub details: Vec<ErrorDetail>,
    pub response: Response,
}

impl ResponseError {
    pub fn from_response(response: &Response) -> Self {
        let service = serde_json::from_slice::<ErrorEnvelope>(response.body())
            .ok()
            .and_then(|envelope| envelope.error);
        let (body_code, message, details) = match service {
            Some(err) => (err.code, err.message, err.details),
            None => (None, None, Vec::new()),
        };

        // The header wins when both are present
        let error_code = response
            .header(HEADER_ERROR_CODE)
            .map(str::to_string)
            .or(body_code);

        Self {
            status: response.status(),
            error_code,
            message,
            details,
            response: response.clone(),
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed with status {}",
            self.response.method(),
            self.response.url(),
            self.status
        )?;
        if let Some(code) = &self.error_code {
            write!(f, " ({code})")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ResponseError {}
