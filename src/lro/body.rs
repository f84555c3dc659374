//! Provisioning-state strategy
//!
//! For PUT and PATCH without polling headers: the resource URL itself is
//! polled and `properties.provisioningState` tracks progress.

use super::{provisioning_state, OperationStatus};
use crate::error::Result;
use crate::http::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};

pub const KIND: &str = "body";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyOperation {
    #[serde(rename = "pollURL")]
    poll_url: String,
    state: OperationStatus,
}

impl BodyOperation {
    /// Must be checked after the header-based strategies.
    pub fn applicable(response: &Response) -> bool {
        let method = response.method();
        method == Method::PUT || method == Method::PATCH
    }

    pub fn new(response: &Response) -> Result<Self> {
        let provisioned = if response.has_body() {
            provisioning_state(response)?
        } else {
            None
        };

        // 201 without a state is still running, 200 without one finished synchronously
        let state = match (response.status(), provisioned) {
            (StatusCode::CREATED, Some(state)) | (StatusCode::OK, Some(state)) => state,
            (StatusCode::OK, None) | (StatusCode::NO_CONTENT, _) => OperationStatus::succeeded(),
            _ => OperationStatus::in_progress(),
        };

        Ok(Self {
            poll_url: response.url().to_string(),
            state,
        })
    }

    pub fn done(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn status(&self) -> &OperationStatus {
        &self.state
    }

    pub fn poll_url(&self) -> &str {
        &self.poll_url
    }

    pub fn update(&mut self, response: &Response) -> Result<()> {
        if response.status() == StatusCode::NO_CONTENT {
            self.state = OperationStatus::succeeded();
            return Ok(());
        }
        // A body is required here; one without a state means the resource is done
        self.state = provisioning_state(response)?.unwrap_or_else(OperationStatus::succeeded);
        Ok(())
    }

    pub fn final_get_url(&self) -> Option<&str> {
        None
    }
}
