//! Poller
//!
//! Owns one long-running operation: picks the strategy for the initial
//! response (or rebuilds it from a resume token), polls it to a terminal
//! state and fetches the final payload.

use super::async_op::{self, AsyncOperation};
use super::body::{self, BodyOperation};
use super::location::{self, LocationOperation};
use super::{kind_from_token, make_type, status_code_valid, FinalStateVia, OperationStatus};
use crate::context::Context;
use crate::error::{Error, Result, ResponseError};
use crate::http::{retry_after, Method, Pipeline, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Turns a failed or failing response into the caller's error type.
pub type ErrorHandler = Arc<dyn Fn(&Response) -> Error + Send + Sync>;

/// Builds a [`ResponseError`] from the `x-ms-error-code` header and the
/// standard error body.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|response: &Response| ResponseError::from_response(response).into())
}

/// The active polling strategy. `Nop` stands for an operation that already
/// completed synchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Async(AsyncOperation),
    Location(LocationOperation),
    Body(BodyOperation),
    Nop(OperationStatus),
}

impl Operation {
    /// Selects a strategy. The order matters: the body strategy only looks at
    /// the verb, so it would claim responses meant for the other two.
    pub fn select(response: &Response, final_state: Option<FinalStateVia>) -> Result<Self> {
        if AsyncOperation::applicable(response) {
            return AsyncOperation::new(response, final_state).map(Operation::Async);
        }
        if LocationOperation::applicable(response) {
            return LocationOperation::new(response).map(Operation::Location);
        }
        if BodyOperation::applicable(response) {
            return BodyOperation::new(response).map(Operation::Body);
        }

        let method = response.method();
        if response.status() == StatusCode::ACCEPTED
            && (method == Method::DELETE || method == Method::POST)
        {
            return Err(Error::Protocol("response is missing polling URL".to_string()));
        }
        Ok(Operation::Nop(OperationStatus::succeeded()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Async(_) => async_op::KIND,
            Operation::Location(_) => location::KIND,
            Operation::Body(_) => body::KIND,
            Operation::Nop(_) => "nop",
        }
    }

    pub fn done(&self) -> bool {
        match self {
            Operation::Async(op) => op.done(),
            Operation::Location(op) => op.done(),
            Operation::Body(op) => op.done(),
            Operation::Nop(_) => true,
        }
    }

    pub fn status(&self) -> &OperationStatus {
        match self {
            Operation::Async(op) => op.status(),
            Operation::Location(op) => op.status(),
            Operation::Body(op) => op.status(),
            Operation::Nop(status) => status,
        }
    }

    pub fn poll_url(&self) -> Option<&str> {
        match self {
            Operation::Async(op) => Some(op.poll_url()),
            Operation::Location(op) => Some(op.poll_url()),
            Operation::Body(op) => Some(op.poll_url()),
            Operation::Nop(_) => None,
        }
    }

    fn update(&mut self, response: &Response) -> Result<()> {
        match self {
            Operation::Async(op) => op.update(response),
            Operation::Location(op) => op.update(response),
            Operation::Body(op) => op.update(response),
            Operation::Nop(_) => Ok(()),
        }
    }

    fn final_get_url(&self) -> Option<&str> {
        match self {
            Operation::Async(op) => op.final_get_url(),
            Operation::Location(op) => op.final_get_url(),
            Operation::Body(op) => op.final_get_url(),
            Operation::Nop(_) => None,
        }
    }

    fn to_token(&self, poller_id: &str) -> Result<String> {
        let mut value = match self {
            Operation::Async(op) => serde_json::to_value(op)?,
            Operation::Location(op) => serde_json::to_value(op)?,
            Operation::Body(op) => serde_json::to_value(op)?,
            Operation::Nop(_) => {
                return Err(Error::ResumeToken(
                    "cannot create a ResumeToken from a poller in a terminal state".to_string(),
                ))
            }
        };
        if let Value::Object(fields) = &mut value {
            fields.insert(
                "type".to_string(),
                Value::String(make_type(poller_id, self.kind())),
            );
        }
        Ok(serde_json::to_string(&value)?)
    }

    fn from_token(poller_id: &str, token: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(token)
            .map_err(|e| Error::ResumeToken(format!("invalid resume token: {e}")))?;
        let kind = kind_from_token(poller_id, &value)?;
        if let Value::Object(fields) = &mut value {
            fields.remove("type");
        }

        let invalid = |e: serde_json::Error| Error::ResumeToken(format!("invalid resume token: {e}"));
        match kind.as_str() {
            async_op::KIND => serde_json::from_value(value).map(Operation::Async).map_err(invalid),
            location::KIND => serde_json::from_value(value)
                .map(Operation::Location)
                .map_err(invalid),
            body::KIND => serde_json::from_value(value).map(Operation::Body).map_err(invalid),
            other => Err(Error::ResumeToken(format!("unhandled poller type {other}"))),
        }
    }
}

/// Terminal response of an operation and, when it had a body, the payload
/// decoded from it.
#[derive(Debug, Clone)]
pub struct FinalResponse<T> {
    pub response: Response,
    pub value: Option<T>,
}

pub struct Poller {
    poller_id: String,
    operation: Operation,
    pipeline: Pipeline,
    error_handler: ErrorHandler,
    /// Latest successful response
    response: Option<Response>,
    /// Response that ended the operation in failure
    failure: Option<Response>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("poller_id", &self.poller_id)
            .field("operation", &self.operation)
            .field("failed", &self.failure.is_some())
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Creates a poller from the response to the request that started the
    /// operation.
    pub fn new(
        poller_id: impl Into<String>,
        final_state: Option<FinalStateVia>,
        response: Response,
        pipeline: Pipeline,
        error_handler: ErrorHandler,
    ) -> Result<Self> {
        // Error statuses should never reach this point; refuse them anyway
        if !status_code_valid(&response) {
            return Err(Error::Protocol("the LRO failed or was cancelled".to_string()));
        }

        let operation = Operation::select(&response, final_state)?;
        tracing::debug!(
            "{} {} started {} operation, status {}",
            response.method(),
            response.url(),
            operation.kind(),
            operation.status()
        );

        let (response, failure) = if operation.status().is_failure() {
            (None, Some(response))
        } else {
            (Some(response), None)
        };

        Ok(Self {
            poller_id: poller_id.into(),
            operation,
            pipeline,
            error_handler,
            response,
            failure,
        })
    }

    /// Rebuilds a poller from [`Poller::resume_token`] output. `poller_id`
    /// must match the one the token was created with.
    pub fn from_resume_token(
        poller_id: impl Into<String>,
        token: &str,
        pipeline: Pipeline,
        error_handler: ErrorHandler,
    ) -> Result<Self> {
        let poller_id = poller_id.into();
        let operation = Operation::from_token(&poller_id, token)?;
        tracing::debug!(
            "Resumed {} operation {} at status {}",
            operation.kind(),
            poller_id,
            operation.status()
        );

        Ok(Self {
            poller_id,
            operation,
            pipeline,
            error_handler,
            response: None,
            failure: None,
        })
    }

    pub fn done(&self) -> bool {
        self.failure.is_some() || self.operation.done()
    }

    pub fn status(&self) -> &OperationStatus {
        self.operation.status()
    }

    pub fn kind(&self) -> &'static str {
        self.operation.kind()
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn poll_url(&self) -> Option<&str> {
        self.operation.poll_url()
    }

    /// Latest successful response, if any.
    pub fn latest_response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Polls once. After the operation ended this returns the cached
    /// outcome without touching the network.
    pub async fn poll(&mut self, ctx: &Context) -> Result<Response> {
        if self.done() {
            return self.terminal_outcome();
        }

        let url = self
            .operation
            .poll_url()
            .ok_or_else(|| Error::Protocol("operation has no polling URL".to_string()))?;
        let mut request = Request::get(Url::parse(url)?);
        let response = self.pipeline.send(ctx, &mut request).await?;

        if !status_code_valid(&response) {
            tracing::debug!("{} poll returned {}", self.operation.kind(), response.status());
            return Err(self.fail(response));
        }

        self.operation.update(&response)?;
        tracing::debug!("{} poll status {}", self.operation.kind(), self.operation.status());

        if self.operation.status().is_failure() {
            return Err(self.fail(response));
        }
        self.response = Some(response.clone());
        Ok(response)
    }

    fn fail(&mut self, response: Response) -> Error {
        let err = (self.error_handler)(&response);
        self.response = None;
        self.failure = Some(response);
        err
    }

    fn terminal_outcome(&self) -> Result<Response> {
        if let Some(failure) = &self.failure {
            return Err((self.error_handler)(failure));
        }
        self.response
            .clone()
            .ok_or_else(|| Error::Protocol("the poller has no terminal response".to_string()))
    }

    /// Serializes the operation so polling can continue elsewhere.
    pub fn resume_token(&self) -> Result<String> {
        if self.done() {
            return Err(Error::ResumeToken(
                "cannot create a ResumeToken from a poller in a terminal state".to_string(),
            ));
        }
        self.operation.to_token(&self.poller_id)
    }

    /// The latest terminal response, as received. No final GET is made.
    pub fn final_raw_response(&self) -> Result<Response> {
        self.ensure_terminal()?;
        self.terminal_outcome()
    }

    /// The final payload decoded as `T`. When the terminal response has a
    /// body and the strategy names a final GET URL, the resource is fetched
    /// from there first. A 204 or an empty body yields no value.
    pub async fn final_response<T: DeserializeOwned>(
        &mut self,
        ctx: &Context,
    ) -> Result<FinalResponse<T>> {
        self.ensure_terminal()?;
        let mut response = self.terminal_outcome()?;

        if response.has_body() {
            if let Some(url) = self.operation.final_get_url() {
                tracing::debug!("Performing final GET {}", url);
                let mut request = Request::get(Url::parse(url)?);
                let fetched = self.pipeline.send(ctx, &mut request).await?;
                if !status_code_valid(&fetched) {
                    return Err((self.error_handler)(&fetched));
                }
                self.response = Some(fetched.clone());
                response = fetched;
            }
        }

        let value = if response.status() == StatusCode::NO_CONTENT || !response.has_body() {
            None
        } else {
            Some(response.json()?)
        };
        Ok(FinalResponse { response, value })
    }

    fn ensure_terminal(&self) -> Result<()> {
        if self.done() {
            return Ok(());
        }
        Err(Error::Protocol(
            "cannot return a final response from a poller in a non-terminal state".to_string(),
        ))
    }

    /// Polls until the operation ends, then returns its final response.
    ///
    /// Waits `frequency` between polls unless the service sends
    /// `Retry-After`. Cancelling `ctx` aborts the wait.
    pub async fn poll_until_done<T: DeserializeOwned>(
        &mut self,
        ctx: &Context,
        frequency: Duration,
    ) -> Result<FinalResponse<T>> {
        self.wait(ctx, frequency).await?;
        self.final_response(ctx).await
    }

    /// [`Poller::poll_until_done`] without decoding the payload.
    pub async fn poll_until_done_raw(
        &mut self,
        ctx: &Context,
        frequency: Duration,
    ) -> Result<Response> {
        self.wait(ctx, frequency).await?;
        self.final_raw_response()
    }

    async fn wait(&mut self, ctx: &Context, frequency: Duration) -> Result<()> {
        if frequency.is_zero() {
            return Err(Error::Protocol(
                "polling frequency must be greater than zero".to_string(),
            ));
        }

        let started = tokio::time::Instant::now();
        tracing::debug!("BEGIN poll_until_done for {} operation", self.kind());

        if let Some(delay) = self.response.as_ref().and_then(retry_after) {
            tracing::debug!("Initial Retry-After delay {:?}", delay);
            ctx.sleep(delay).await?;
        }

        loop {
            let response = match self.poll(ctx).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::debug!("END poll_until_done: {} after {:?}", err, started.elapsed());
                    return Err(err);
                }
            };
            if self.done() {
                tracing::debug!(
                    "END poll_until_done: {} after {:?}",
                    self.status(),
                    started.elapsed()
                );
                return Ok(());
            }

            let delay = retry_after(&response).unwrap_or(frequency);
            tracing::debug!("Next poll in {:?}", delay);
            ctx.sleep(delay).await?;
        }
    }
}
