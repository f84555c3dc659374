//! Policy pipeline
//!
//! A pipeline is an ordered list of policies. Each policy may inspect or
//! rewrite the request, then hands it to the rest of the list with
//! [`send_next`]. The last policy is the transport and never calls further.

use super::{Request, Response, HEADER_CLIENT_REQUEST_ID};
use crate::context::Context;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait Policy: Send + Sync + fmt::Debug {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> Result<Response>;
}

/// Forwards `request` to the first policy of `next`.
pub async fn send_next(
    ctx: &Context,
    request: &mut Request,
    next: &[Arc<dyn Policy>],
) -> Result<Response> {
    let Some((policy, rest)) = next.split_first() else {
        return Err(Error::Protocol(
            "pipeline ended without a transport policy".to_string(),
        ));
    };
    policy.send(ctx, request, rest).await
}

/// Ordered, shareable list of policies. Cloning is cheap.
#[derive(Clone, Debug)]
pub struct Pipeline {
    policies: Arc<[Arc<dyn Policy>]>,
}

impl Pipeline {
    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        Self {
            policies: policies.into(),
        }
    }

    pub async fn send(&self, ctx: &Context, request: &mut Request) -> Result<Response> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        send_next(ctx, request, &self.policies).await
    }
}

/// Stamps `x-ms-client-request-id` unless the caller already set one.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestIdPolicy;

#[async_trait]
impl Policy for RequestIdPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> Result<Response> {
        if request.header(HEADER_CLIENT_REQUEST_ID).is_none() {
            let id = Uuid::new_v4().to_string();
            request.insert_header(HEADER_CLIENT_REQUEST_ID, &id)?;
        }
        send_next(ctx, request, next).await
    }
}
