//! Resource provider registration
//!
//! A subscription must register a resource provider before it can create
//! that provider's resources. Requests against an unregistered provider fail
//! with 409 `MissingSubscriptionRegistration`; [`RegistrationPolicy`]
//! registers the provider, waits for the registration to complete and sends
//! the request again.

use crate::context::Context;
use crate::error::{Error, ResponseError, Result};
use crate::http::{send_next, Method, Pipeline, Policy, Request, Response, StatusCode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const PROVIDERS_API_VERSION: &str = "2019-05-01";

const MISSING_SUBSCRIPTION_REGISTRATION: &str = "MissingSubscriptionRegistration";
const REGISTERED_STATE: &str = "Registered";

/// A resource provider as returned by the providers API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_state: Option<String>,
}

impl Provider {
    pub fn is_registered(&self) -> bool {
        self.registration_state
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(REGISTERED_STATE))
    }
}

/// Client for `/subscriptions/{id}/providers/{namespace}`.
#[derive(Debug, Clone)]
pub struct ProvidersClient {
    origin: Url,
    pipeline: Pipeline,
}

impl ProvidersClient {
    /// `origin` supplies scheme and host; its path is ignored.
    pub fn new(origin: Url, pipeline: Pipeline) -> Self {
        Self { origin, pipeline }
    }

    fn provider_url(&self, subscription: &str, namespace: &str, action: Option<&str>) -> Result<Url> {
        let mut path = format!(
            "/subscriptions/{}/providers/{}",
            urlencoding::encode(subscription),
            urlencoding::encode(namespace)
        );
        if let Some(action) = action {
            path.push('/');
            path.push_str(action);
        }

        let mut url = self.origin.join(&path)?;
        url.set_query(Some(&format!("api-version={PROVIDERS_API_VERSION}")));
        Ok(url)
    }

    async fn call(&self, ctx: &Context, mut request: Request) -> Result<Provider> {
        let response = self.pipeline.send(ctx, &mut request).await?;
        if !response.status().is_success() {
            return Err(ResponseError::from_response(&response).into());
        }
        response.json()
    }

    /// Starts registration of `namespace` for `subscription`.
    pub async fn register(&self, ctx: &Context, subscription: &str, namespace: &str) -> Result<Provider> {
        let url = self.provider_url(subscription, namespace, Some("register"))?;
        self.call(ctx, Request::new(Method::POST, url)).await
    }

    /// Current state of `namespace` for `subscription`.
    pub async fn get(&self, ctx: &Context, subscription: &str, namespace: &str) -> Result<Provider> {
        let url = self.provider_url(subscription, namespace, None)?;
        self.call(ctx, Request::get(url)).await
    }

    /// Registers and polls every `delay` until registered or `ctx` ends.
    pub async fn register_and_wait(
        &self,
        ctx: &Context,
        subscription: &str,
        namespace: &str,
        delay: Duration,
    ) -> Result<Provider> {
        self.register_and_poll(ctx, ctx, subscription, namespace, delay)
            .await
    }

    /// Registers under `ctx`, then polls under `poll_ctx`.
    async fn register_and_poll(
        &self,
        ctx: &Context,
        poll_ctx: &Context,
        subscription: &str,
        namespace: &str,
        delay: Duration,
    ) -> Result<Provider> {
        tracing::info!("BEGIN registration for {}", namespace);
        if let Err(err) = self.register(ctx, subscription, namespace).await {
            tracing::warn!("Registering {} failed: {}", namespace, err);
            return Err(err);
        }

        let outcome = self
            .wait_registered(poll_ctx, subscription, namespace, delay)
            .await;
        match &outcome {
            Ok(_) => tracing::info!("END registration for {}", namespace),
            Err(err) => tracing::info!("END registration for {}: {}", namespace, err),
        }
        outcome
    }

    async fn wait_registered(
        &self,
        ctx: &Context,
        subscription: &str,
        namespace: &str,
        delay: Duration,
    ) -> Result<Provider> {
        let mut last_state = String::new();
        loop {
            let provider = self.get(ctx, subscription, namespace).await?;
            if let Some(state) = &provider.registration_state {
                if !state.eq_ignore_ascii_case(&last_state) {
                    tracing::info!("Registration state of {} is {}", namespace, state);
                    last_state = state.clone();
                }
            }
            if provider.is_registered() {
                return Ok(provider);
            }
            ctx.sleep(delay).await?;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// Register-and-retry cycles per request; 0 turns the policy off
    pub max_attempts: u32,
    /// Delay between registration state checks
    pub polling_delay: Duration,
    /// How long to wait for one registration to complete
    pub polling_duration: Duration,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            polling_delay: Duration::from_secs(15),
            polling_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Registers missing resource providers on demand.
///
/// Registration calls go through `providers`, which must not contain this
/// policy.
#[derive(Debug, Clone)]
pub struct RegistrationPolicy {
    options: RegistrationOptions,
    providers: Pipeline,
}

impl RegistrationPolicy {
    pub fn new(options: RegistrationOptions, providers: Pipeline) -> Self {
        Self { options, providers }
    }
}

/// The path segment following `subscriptions`.
pub(crate) fn subscription_from_path(path: &str) -> Option<&str> {
    let mut segments = path.split('/');
    segments
        .by_ref()
        .find(|segment| *segment == "subscriptions")?;
    segments.next().filter(|id| !id.is_empty())
}

/// Provider namespace named by an unregistered-provider conflict.
fn unregistered_namespace(response: &Response) -> Option<Result<String>> {
    let err = ResponseError::from_response(response);
    if err.error_code.as_deref() != Some(MISSING_SUBSCRIPTION_REGISTRATION) {
        return None;
    }
    let namespace = err
        .details
        .first()
        .and_then(|detail| detail.target.clone())
        .filter(|target| !target.is_empty())
        .ok_or_else(|| {
            Error::Protocol("missing provider namespace in error details".to_string())
        });
    Some(namespace)
}

fn registration_error(response: Response, source: Error) -> Error {
    Error::Registration {
        response: Box::new(response),
        source: Box::new(source),
    }
}

#[async_trait]
impl Policy for RegistrationPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> Result<Response> {
        if self.options.max_attempts == 0 {
            return send_next(ctx, request, next).await;
        }

        let original = request.clone();
        let mut namespace = String::new();
        let mut last_conflict = None;

        for attempt in 0..self.options.max_attempts {
            if attempt > 0 {
                *request = original.clone();
            }

            let response = send_next(ctx, request, next).await?;
            if response.status() != StatusCode::CONFLICT {
                return Ok(response);
            }
            namespace = match unregistered_namespace(&response) {
                None => return Ok(response),
                Some(Ok(namespace)) => namespace,
                Some(Err(err)) => return Err(registration_error(response, err)),
            };
            let Some(subscription) = subscription_from_path(original.url().path()) else {
                let err = Error::Protocol(format!(
                    "failed to obtain subscription ID from {}",
                    original.url().path()
                ));
                return Err(registration_error(response, err));
            };

            let providers = ProvidersClient::new(original.url().clone(), self.providers.clone());
            let poll_ctx = ctx.with_timeout(self.options.polling_duration);
            let registered = providers
                .register_and_poll(ctx, &poll_ctx, subscription, &namespace, self.options.polling_delay)
                .await;
            if let Err(err) = registered {
                return Err(registration_error(response, err));
            }

            last_conflict = Some(response);
        }

        match last_conflict {
            Some(response) => Err(Error::RegistrationAttemptsExceeded {
                namespace,
                response: Box::new(response),
            }),
            None => Err(Error::Protocol(format!("exceeded attempts to register {namespace}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    fn conflict(body: &str) -> Response {
        Response::new(
            StatusCode::CONFLICT,
            HeaderMap::new(),
            body.as_bytes().to_vec(),
            Method::PUT,
            Url::parse("https://management.example.com/subscriptions/sub1/resourceGroups/rg").unwrap(),
        )
    }

    #[test]
    fn test_subscription_from_path() {
        assert_eq!(
            subscription_from_path("/subscriptions/sub1/resourceGroups/rg/providers/Microsoft.Storage"),
            Some("sub1")
        );
        assert_eq!(subscription_from_path("/subscriptions/sub1"), Some("sub1"));
        assert_eq!(subscription_from_path("/subscriptions/"), None);
        assert_eq!(subscription_from_path("/subscriptions"), None);
        assert_eq!(subscription_from_path("/tenants/t1"), None);
    }

    #[test]
    fn test_unregistered_namespace() {
        let resp = conflict(
            r#"{"error":{"code":"MissingSubscriptionRegistration","details":[{"code":"MissingSubscriptionRegistration","target":"Microsoft.Storage"}]}}"#,
        );
        assert_eq!(unregistered_namespace(&resp).unwrap().unwrap(), "Microsoft.Storage");

        let resp = conflict(r#"{"error":{"code":"MissingSubscriptionRegistration","details":[]}}"#);
        assert!(unregistered_namespace(&resp).unwrap().is_err());

        let resp = conflict(r#"{"error":{"code":"Conflict","details":[{"target":"Microsoft.Storage"}]}}"#);
        assert!(unregistered_namespace(&resp).is_none());

        assert!(unregistered_namespace(&conflict("<html/>")).is_none());
    }

    #[test]
    fn test_provider_url() {
        let client = ProvidersClient::new(
            Url::parse("https://management.example.com/subscriptions/sub1/whatever?x=1").unwrap(),
            Pipeline::new(Vec::new()),
        );
        let url = client.provider_url("sub1", "Microsoft.Storage", Some("register")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://management.example.com/subscriptions/sub1/providers/Microsoft.Storage/register?api-version=2019-05-01"
        );
    }

    #[test]
    fn test_provider_registration_state() {
        let provider: Provider =
            serde_json::from_str(r#"{"namespace":"Microsoft.Storage","registrationState":"registered"}"#)
                .unwrap();
        assert!(provider.is_registered());
        assert!(!Provider::default().is_registered());
    }
}
