//! Resource manager client
//!
//! Wires credentials, retries and provider registration into a pipeline and
//! starts or resumes long-running operations on top of it.

use crate::auth::{default_scope, BearerTokenOptions, BearerTokenPolicy, TokenCredential};
use crate::context::Context;
use crate::error::{ResponseError, Result};
use crate::http::{HttpTransport, Pipeline, Policy, Request, RequestIdPolicy, Response, RetryOptions, RetryPolicy};
use crate::lro::{default_error_handler, FinalStateVia, Poller};
use crate::registration::{ProvidersClient, RegistrationOptions, RegistrationPolicy};
use std::sync::Arc;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Defaults to the endpoint's `.default` scope
    pub scopes: Option<Vec<String>>,
    pub auxiliary_tenants: Vec<String>,
    pub retry: RetryOptions,
    pub registration: RegistrationOptions,
}

/// Main resource manager client
#[derive(Clone, Debug)]
pub struct ArmClient {
    endpoint: Url,
    pipeline: Pipeline,
    providers: Pipeline,
}

impl ArmClient {
    /// Create a client talking to `endpoint` over HTTPS
    pub fn new(
        endpoint: Url,
        credential: Arc<dyn TokenCredential>,
        options: ClientOptions,
    ) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new()?);
        Ok(Self::with_transport(endpoint, credential, options, transport))
    }

    /// Create a client with a custom terminal policy
    pub fn with_transport(
        endpoint: Url,
        credential: Arc<dyn TokenCredential>,
        options: ClientOptions,
        transport: Arc<dyn Policy>,
    ) -> Self {
        let scopes = options
            .scopes
            .clone()
            .unwrap_or_else(|| vec![default_scope(&endpoint)]);
        let bearer: Arc<dyn Policy> = Arc::new(BearerTokenPolicy::new(
            credential,
            BearerTokenOptions {
                scopes,
                auxiliary_tenants: options.auxiliary_tenants.clone(),
            },
        ));
        let request_id: Arc<dyn Policy> = Arc::new(RequestIdPolicy);
        let retry: Arc<dyn Policy> = Arc::new(RetryPolicy::new(options.retry.clone()));

        // Registration calls share the token cache but skip the registration stage
        let providers = Pipeline::new(vec![
            request_id.clone(),
            bearer.clone(),
            retry.clone(),
            transport.clone(),
        ]);
        let registration: Arc<dyn Policy> = Arc::new(RegistrationPolicy::new(
            options.registration.clone(),
            providers.clone(),
        ));
        let pipeline = Pipeline::new(vec![request_id, bearer, registration, retry, transport]);

        Self {
            endpoint,
            pipeline,
            providers,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Resolve a path (with query) against the endpoint
    pub fn url(&self, path: &str) -> Result<Url> {
        Ok(self.endpoint.join(path)?)
    }

    /// Send a request through the full pipeline. Error statuses are returned
    /// as responses.
    pub async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        self.pipeline.send(ctx, &mut request).await
    }

    /// Send a request that starts a long-running operation and return its
    /// poller.
    pub async fn begin(
        &self,
        ctx: &Context,
        poller_id: &str,
        final_state: Option<FinalStateVia>,
        request: Request,
    ) -> Result<Poller> {
        let response = self.send(ctx, request).await?;
        if !response.status().is_success() {
            return Err(ResponseError::from_response(&response).into());
        }
        Poller::new(
            poller_id,
            final_state,
            response,
            self.pipeline.clone(),
            default_error_handler(),
        )
    }

    /// Pick up an operation from a resume token
    pub fn resume(&self, poller_id: &str, token: &str) -> Result<Poller> {
        Poller::from_resume_token(poller_id, token, self.pipeline.clone(), default_error_handler())
    }

    pub fn providers(&self) -> ProvidersClient {
        ProvidersClient::new(self.endpoint.clone(), self.providers.clone())
    }
}
