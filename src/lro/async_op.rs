//! `Azure-AsyncOperation` strategy
//!
//! The initial response points at an operation status document whose
//! top-level `status` is polled. The resource itself is fetched once the
//! operation ends, from a URL that depends on the verb and the final-state
//! hint.

use super::{is_valid_url, operation_status, provisioning_state, FinalStateVia, OperationStatus};
use crate::error::{Error, Result};
use crate::http::{Method, Response, HEADER_AZURE_ASYNC_OPERATION, HEADER_LOCATION};
use serde::{Deserialize, Serialize};

pub const KIND: &str = "async";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncOperation {
    #[serde(rename = "asyncURL")]
    async_url: String,
    #[serde(rename = "locURL", default, skip_serializing_if = "Option::is_none")]
    location_url: Option<String>,
    #[serde(rename = "origURL")]
    original_url: String,
    method: String,
    #[serde(rename = "finalState", default, skip_serializing_if = "Option::is_none")]
    final_state: Option<FinalStateVia>,
    state: OperationStatus,
}

impl AsyncOperation {
    pub fn applicable(response: &Response) -> bool {
        response.header(HEADER_AZURE_ASYNC_OPERATION).is_some()
    }

    pub fn new(response: &Response, final_state: Option<FinalStateVia>) -> Result<Self> {
        let async_url = response
            .header(HEADER_AZURE_ASYNC_OPERATION)
            .ok_or_else(|| {
                Error::Protocol("response is missing Azure-AsyncOperation header".to_string())
            })?;
        if !is_valid_url(async_url) {
            return Err(Error::Protocol(format!("invalid polling URL {async_url}")));
        }

        // PUT is supposed to carry a provisioning state here, but servers that
        // leave it out are common enough to accept
        let state = if response.has_body() {
            provisioning_state(response)?
        } else {
            None
        };

        Ok(Self {
            async_url: async_url.to_string(),
            location_url: response.header(HEADER_LOCATION).map(str::to_string),
            original_url: response.url().to_string(),
            method: response.method().as_str().to_string(),
            final_state,
            state: state.unwrap_or_else(OperationStatus::in_progress),
        })
    }

    pub fn done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn status(&self) -> &OperationStatus {
        &self.state
    }

    pub fn poll_url(&self) -> &str {
        &self.async_url
    }

    pub fn update(&mut self, response: &Response) -> Result<()> {
        let state = operation_status(response)?.ok_or_else(|| {
            Error::Protocol("the response did not contain a status".to_string())
        })?;
        self.state = state;
        Ok(())
    }

    /// PUT and PATCH read the resource back from its own URL. POST follows
    /// the final-state hint, falling back to the `Location` header.
    pub fn final_get_url(&self) -> Option<&str> {
        let method = self.method.to_ascii_uppercase();
        if method == Method::PUT.as_str() || method == Method::PATCH.as_str() {
            return Some(&self.original_url);
        }
        if method != Method::POST.as_str() {
            return None;
        }
        match self.final_state {
            Some(FinalStateVia::AzureAsyncOperation) => None,
            Some(FinalStateVia::OriginalUri) => Some(&self.original_url),
            _ => self.location_url.as_deref(),
        }
    }
}
