//! Retry policy
//!
//! Replays requests that were throttled or hit a transient server error.
//! Errors from further down the pipeline (transport failures included) are
//! returned as-is. A response whose `Retry-After` exceeds `max_retry_delay`
//! is returned without retrying.

use super::{retry_after, send_next, Policy, Request, Response};
use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    /// Base delay, doubled on every retry
    pub retry_delay: Duration,
    /// Upper bound for any delay. A longer `Retry-After` ends retrying.
    pub max_retry_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(800),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

pub fn is_retriable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Delay before retry number `retry + 1`, or `None` when the service
    /// asks for a longer wait than this policy allows.
    fn delay_for(&self, retry: u32, response: &Response) -> Option<Duration> {
        if let Some(delay) = retry_after(response) {
            return (delay <= self.options.max_retry_delay).then_some(delay);
        }
        let factor = 2u32.saturating_pow(retry);
        Some(
            self.options
                .retry_delay
                .saturating_mul(factor)
                .min(self.options.max_retry_delay),
        )
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> Result<Response> {
        let original = request.clone();
        let mut retry = 0;

        loop {
            let response = send_next(ctx, request, next).await?;
            if !is_retriable_status(response.status()) || retry >= self.options.max_retries {
                return Ok(response);
            }

            let Some(delay) = self.delay_for(retry, &response) else {
                tracing::debug!(
                    "{} {} returned {} with a retry-after beyond {:?}, not retrying",
                    original.method(),
                    original.url(),
                    response.status(),
                    self.options.max_retry_delay
                );
                return Ok(response);
            };
            tracing::debug!(
                "{} {} returned {}, retry {} in {:?}",
                original.method(),
                original.url(),
                response.status(),
                retry + 1,
                delay
            );
            ctx.sleep(delay).await?;

            retry += 1;
            *request = original.clone();
        }
    }
}
