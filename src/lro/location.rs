//! `Location` strategy
//!
//! A 202 with a `Location` header. The URL answers 202 while the operation
//! runs and anything else once it ends; there is never a final GET.

use super::{is_valid_url, provisioning_state, OperationStatus};
use crate::error::{Error, Result};
use crate::http::{Response, StatusCode, HEADER_LOCATION};
use serde::{Deserialize, Serialize};

pub const KIND: &str = "loc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationOperation {
    #[serde(rename = "pollURL")]
    poll_url: String,
    state: OperationStatus,
}

impl LocationOperation {
    pub fn applicable(response: &Response) -> bool {
        response.status() == StatusCode::ACCEPTED && response.header(HEADER_LOCATION).is_some()
    }

    pub fn new(response: &Response) -> Result<Self> {
        let poll_url = response
            .header(HEADER_LOCATION)
            .ok_or_else(|| Error::Protocol("response is missing Location header".to_string()))?;
        if !is_valid_url(poll_url) {
            return Err(Error::Protocol(format!("invalid polling URL {poll_url}")));
        }

        Ok(Self {
            poll_url: poll_url.to_string(),
            state: OperationStatus::in_progress(),
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
        // The service may move the operation between polls
        if let Some(location) = response.header(HEADER_LOCATION) {
            if !is_valid_url(location) {
                return Err(Error::Protocol(format!("invalid polling URL {location}")));
            }
            self.poll_url = location.to_string();
        }

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            let state = if response.has_body() {
                provisioning_state(response)?
            } else {
                None
            };
            self.state = state.unwrap_or_else(OperationStatus::succeeded);
        } else if status == StatusCode::NO_CONTENT {
            self.state = OperationStatus::succeeded();
        } else if status.is_client_error() {
            self.state = OperationStatus::failed();
        }
        // 202: still running
        Ok(())
    }

    pub fn final_get_url(&self) -> Option<&str> {
        None
    }
}
