//! Long-running operations
//!
//! A mutating call that cannot finish synchronously answers with one of
//! three polling conventions. Each convention is a strategy:
//!
//! - [`async_op`] - `Azure-AsyncOperation` header, status document polling
//! - [`location`] - 202 with a `Location` header, polled until a non-202
//! - [`body`] - PUT/PATCH whose resource carries `provisioningState`
//!
//! [`Poller`] picks one, drives it to a terminal state and fetches the final
//! payload. A live poller can be written out as a resume token and picked up
//! again later, possibly by another process.

pub mod async_op;
pub mod body;
pub mod location;
mod poller;

pub use poller::{default_error_handler, ErrorHandler, FinalResponse, Operation, Poller};

use crate::error::{Error, Result};
use crate::http::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use url::Url;

pub const STATUS_IN_PROGRESS: &str = "InProgress";
pub const STATUS_SUCCEEDED: &str = "Succeeded";
pub const STATUS_FAILED: &str = "Failed";
pub const STATUS_CANCELED: &str = "Canceled";

/// Operation status as reported by the service.
///
/// Any string is accepted; only `Succeeded`, `Failed` and `Canceled` are
/// terminal, compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationStatus(String);

impl OperationStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn in_progress() -> Self {
        Self::new(STATUS_IN_PROGRESS)
    }

    pub fn succeeded() -> Self {
        Self::new(STATUS_SUCCEEDED)
    }

    pub fn failed() -> Self {
        Self::new(STATUS_FAILED)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_success(&self) -> bool {
        self.0.eq_ignore_ascii_case(STATUS_SUCCEEDED)
    }

    /// `Failed` or `Canceled`
    pub fn is_failure(&self) -> bool {
        self.0.eq_ignore_ascii_case(STATUS_FAILED) || self.0.eq_ignore_ascii_case(STATUS_CANCELED)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationStatus {
    fn from(status: &str) -> Self {
        Self::new(status)
    }
}

/// Where a POST operation's final payload lives, as declared by the API
/// description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinalStateVia {
    #[serde(rename = "azure-async-operation")]
    AzureAsyncOperation,
    #[serde(rename = "location")]
    Location,
    #[serde(rename = "original-uri")]
    OriginalUri,
}

impl FinalStateVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStateVia::AzureAsyncOperation => "azure-async-operation",
            FinalStateVia::Location => "location",
            FinalStateVia::OriginalUri => "original-uri",
        }
    }
}

impl fmt::Display for FinalStateVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalStateVia {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "azure-async-operation" => Ok(FinalStateVia::AzureAsyncOperation),
            "location" => Ok(FinalStateVia::Location),
            "original-uri" => Ok(FinalStateVia::OriginalUri),
            other => Err(Error::Protocol(format!("unknown final-state-via {other}"))),
        }
    }
}

/// 200, 201, 202 and 204 are the only statuses a live operation may return.
pub(crate) fn status_code_valid(response: &Response) -> bool {
    matches!(
        response.status(),
        StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT
    )
}

pub(crate) fn is_valid_url(s: &str) -> bool {
    Url::parse(s).map(|u| u.has_host()).unwrap_or(false)
}

fn body_json(response: &Response) -> Result<Value> {
    if !response.has_body() {
        return Err(Error::Protocol(
            "the response did not contain a body".to_string(),
        ));
    }
    response.json()
}

fn non_empty_status(value: Option<&Value>) -> Option<OperationStatus> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(OperationStatus::from)
}

/// `properties.provisioningState` from the body. Errors on an empty or
/// non-JSON body.
pub(crate) fn provisioning_state(response: &Response) -> Result<Option<OperationStatus>> {
    let body = body_json(response)?;
    Ok(non_empty_status(body.pointer("/properties/provisioningState")))
}

/// Top-level `status` from an operation status document.
pub(crate) fn operation_status(response: &Response) -> Result<Option<OperationStatus>> {
    let body = body_json(response)?;
    Ok(non_empty_status(body.get("status")))
}

fn make_type(poller_id: &str, kind: &str) -> String {
    format!("{poller_id};{kind}")
}

/// Checks the `type` field of a parsed token against `poller_id` and returns
/// the strategy kind it names.
fn kind_from_token(poller_id: &str, token: &Value) -> Result<String> {
    let raw = match token.get("type") {
        None => return Err(Error::ResumeToken("missing type field".to_string())),
        Some(Value::String(raw)) => raw,
        Some(other) => {
            return Err(Error::ResumeToken(format!("invalid type format {other}")));
        }
    };

    let mut parts = raw.split(';');
    let (id, kind) = match (parts.next(), parts.next(), parts.next()) {
        (Some(id), Some(kind), None) => (id, kind),
        _ => return Err(Error::ResumeToken(format!("invalid token {raw}"))),
    };

    if id != poller_id {
        return Err(Error::ResumeToken(format!(
            "cannot resume from this poller token. expected {poller_id}, received {id}"
        )));
    }
    Ok(kind.to_string())
}
