//! Bearer token policy
//!
//! Keeps one cached authorization header per policy instance and refreshes it
//! single-flight:
//!
//! - a comfortably valid header is used without waiting
//! - the first caller that finds the header missing or inside the refresh
//!   window becomes the refresher and fetches outside the lock
//! - while a refresh is running, callers holding an unexpired header keep
//!   using it; callers without one wait for the refresher to publish
//!
//! The refresher always clears `renewing` and wakes waiters, on success, on
//! failure and when its future is dropped.
//!
//! A 401 carrying a `Bearer error="insufficient_claims"` challenge drops the
//! rejected header, refreshes with the challenge's claims and resends the
//! request once.

use super::{AccessToken, TokenCredential, TokenRequest};
use crate::context::Context;
use crate::error::{Error, ResponseError, Result};
use crate::http::{
    send_next, Policy, Request, Response, StatusCode, HEADER_AUTHORIZATION,
    HEADER_AUXILIARY_AUTHORIZATION, HEADER_WWW_AUTHENTICATE,
};
use async_trait::async_trait;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Tokens this close to expiry are refreshed before use
const REFRESH_WINDOW: chrono::Duration = chrono::Duration::minutes(2);

/// Challenge claims are standard base64, not always padded
const CLAIMS_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Default)]
pub struct BearerTokenOptions {
    pub scopes: Vec<String>,
    /// Tenants that also get a token, sent in `x-ms-authorization-auxiliary`
    pub auxiliary_tenants: Vec<String>,
}

#[derive(Clone)]
struct Published {
    authorization: String,
    auxiliary: Option<String>,
    /// Earliest expiry across the primary and auxiliary tokens
    expires_on: DateTime<Utc>,
}

impl Published {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_on
    }
}

#[derive(Default)]
struct TokenState {
    published: Option<Published>,
    renewing: bool,
    /// Bumped every time a refresh publishes a header or a failure
    generation: u64,
    last_failure: Option<String>,
}

enum Freshness {
    Valid(Published),
    Expiring(Published),
    Missing,
}

impl TokenState {
    fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        match &self.published {
            Some(p) if p.expires_on - now > REFRESH_WINDOW => Freshness::Valid(p.clone()),
            Some(p) if !p.is_expired(now) => Freshness::Expiring(p.clone()),
            _ => Freshness::Missing,
        }
    }
}

pub struct BearerTokenPolicy {
    credential: Arc<dyn TokenCredential>,
    options: BearerTokenOptions,
    state: Mutex<TokenState>,
    refreshed: Notify,
}

impl fmt::Debug for BearerTokenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenPolicy")
            .field("credential", &self.credential)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Held by the refresher. Dropping it without publishing (the refresher's
/// future was cancelled) still releases `renewing`.
struct RenewGuard<'a> {
    policy: &'a BearerTokenPolicy,
    released: bool,
}

impl RenewGuard<'_> {
    fn publish(mut self, outcome: &Result<Published>) {
        let mut state = self.policy.lock_state();
        match outcome {
            Ok(published) => {
                state.published = Some(published.clone());
                state.last_failure = None;
                state.generation += 1;
            }
            Err(Error::Credential { message }) => {
                state.last_failure = Some(message.clone());
                state.generation += 1;
            }
            // Cancelled or timed out: nothing to publish, waiters elect a new refresher
            Err(_) => {}
        }
        state.renewing = false;
        drop(state);

        self.released = true;
        self.policy.refreshed.notify_waiters();
    }
}

impl Drop for RenewGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.policy.lock_state().renewing = false;
        self.policy.refreshed.notify_waiters();
    }
}

impl BearerTokenPolicy {
    pub fn new(credential: Arc<dyn TokenCredential>, options: BearerTokenOptions) -> Self {
        Self {
            credential,
            options,
            state: Mutex::new(TokenState::default()),
            refreshed: Notify::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a usable header, refreshing or waiting as needed. `claims` is
    /// passed to the credential if this caller ends up refreshing.
    async fn authorization(&self, ctx: &Context, claims: Option<&str>) -> Result<Published> {
        let mut waited_on: Option<u64> = None;

        loop {
            let notified = {
                let mut state = self.lock_state();

                // A refresh we waited for has finished
                if let Some(generation) = waited_on.take() {
                    if state.generation != generation {
                        if let Some(message) = &state.last_failure {
                            return Err(Error::Credential {
                                message: message.clone(),
                            });
                        }
                        if let Some(p) = state.published.as_ref().filter(|p| !p.is_expired(Utc::now())) {
                            return Ok(p.clone());
                        }
                    }
                }

                match state.freshness(Utc::now()) {
                    Freshness::Valid(published) => return Ok(published),
                    Freshness::Expiring(published) if state.renewing => return Ok(published),
                    _ if !state.renewing => {
                        state.renewing = true;
                        None
                    }
                    Freshness::Missing | Freshness::Expiring(_) => {
                        waited_on = Some(state.generation);
                        // Registered before the lock is released, so a
                        // notify_waiters() in between is not missed
                        Some(self.refreshed.notified())
                    }
                }
            };

            match notified {
                Some(notified) => {
                    ctx.run(async {
                        notified.await;
                        Ok(())
                    })
                    .await?;
                }
                None => {
                    let guard = RenewGuard {
                        policy: self,
                        released: false,
                    };
                    let outcome = self.refresh(ctx, claims).await;
                    guard.publish(&outcome);
                    return outcome;
                }
            }
        }
    }

    /// Forgets `rejected` if it is still the cached header.
    fn invalidate(&self, rejected: &Published) {
        let mut state = self.lock_state();
        if state
            .published
            .as_ref()
            .is_some_and(|p| p.authorization == rejected.authorization)
        {
            state.published = None;
        }
    }

    async fn refresh(&self, ctx: &Context, claims: Option<&str>) -> Result<Published> {
        tracing::debug!(
            "Refreshing bearer token ({} auxiliary tenants, claims: {})",
            self.options.auxiliary_tenants.len(),
            claims.is_some()
        );

        let primary = TokenRequest {
            scopes: self.options.scopes.clone(),
            tenant_id: None,
            claims: claims.map(str::to_string),
        };
        let auxiliary = self.options.auxiliary_tenants.iter().map(|tenant| {
            let request = TokenRequest {
                scopes: self.options.scopes.clone(),
                tenant_id: Some(tenant.clone()),
                claims: None,
            };
            async move { self.credential.get_token(ctx, &request).await }
        });

        let fetched = ctx
            .run(async {
                let token = self.credential.get_token(ctx, &primary).await?;
                let aux = try_join_all(auxiliary).await?;
                Ok((token, aux))
            })
            .await;

        let (token, aux) = match fetched {
            Ok(tokens) => tokens,
            Err(err @ (Error::Cancelled | Error::DeadlineExceeded)) => return Err(err),
            Err(err @ Error::Credential { .. }) => {
                tracing::warn!("Token refresh failed: {}", err);
                return Err(err);
            }
            Err(err) => {
                tracing::warn!("Token refresh failed: {}", err);
                return Err(Error::Credential {
                    message: err.to_string(),
                });
            }
        };

        let expires_on = aux
            .iter()
            .map(|t| t.expires_on)
            .fold(token.expires_on, |earliest, t| earliest.min(t));
        let auxiliary = if aux.is_empty() {
            None
        } else {
            Some(join_bearer(&aux))
        };

        tracing::debug!("Bearer token refreshed, expires at {}", expires_on);
        Ok(Published {
            authorization: format!("Bearer {}", token.token),
            auxiliary,
            expires_on,
        })
    }
}

fn join_bearer(tokens: &[AccessToken]) -> String {
    tokens
        .iter()
        .map(|t| format!("Bearer {}", t.token))
        .collect::<Vec<_>>()
        .join(", ")
}

fn authorize(request: &mut Request, published: &Published) -> Result<()> {
    request.insert_header(HEADER_AUTHORIZATION, &published.authorization)?;
    if let Some(auxiliary) = &published.auxiliary {
        request.insert_header(HEADER_AUXILIARY_AUTHORIZATION, auxiliary)?;
    }
    Ok(())
}

/// One `WWW-Authenticate` challenge.
#[derive(Debug, PartialEq, Eq)]
struct Challenge {
    scheme: String,
    params: Vec<(String, String)>,
}

impl Challenge {
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Splits a `WWW-Authenticate` value into challenges. An unquoted value runs
/// to the next comma, so one malformed challenge does not hide the others.
fn parse_challenges(header: &str) -> Vec<Challenge> {
    let mut challenges: Vec<Challenge> = Vec::new();
    let mut rest = header;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            return challenges;
        }

        let end = rest
            .find(|c: char| c == '=' || c == ',' || c.is_whitespace())
            .unwrap_or(rest.len());
        let token = &rest[..end];

        match rest[end..].trim_start().strip_prefix('=') {
            Some(value) => {
                let value = value.trim_start();
                let (value, remainder) = match value.strip_prefix('"') {
                    Some(quoted) => read_quoted(quoted),
                    None => {
                        let end = value.find(',').unwrap_or(value.len());
                        (value[..end].trim_end().to_string(), &value[end..])
                    }
                };
                if let Some(challenge) = challenges.last_mut() {
                    challenge.params.push((token.to_string(), value));
                }
                rest = remainder;
            }
            None => {
                challenges.push(Challenge {
                    scheme: token.to_string(),
                    params: Vec::new(),
                });
                rest = &rest[end..];
            }
        }
    }
}

/// Reads a quoted-string whose opening quote is already consumed.
fn read_quoted(s: &str) -> (String, &str) {
    let mut value = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return (value, &s[i + 1..]),
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            _ => value.push(c),
        }
    }
    (value, "")
}

/// Decoded claims of a `Bearer error="insufficient_claims"` challenge.
/// Claims that do not decode make the 401 itself the error.
fn claims_challenge(response: &Response) -> Result<Option<String>> {
    let Some(header) = response.header(HEADER_WWW_AUTHENTICATE) else {
        return Ok(None);
    };
    let challenges = parse_challenges(header);
    let encoded = challenges
        .iter()
        .filter(|c| c.scheme.eq_ignore_ascii_case("Bearer"))
        .filter(|c| c.param("error") == Some("insufficient_claims"))
        .find_map(|c| c.param("claims"))
        .filter(|claims| !claims.is_empty());
    let Some(encoded) = encoded else {
        return Ok(None);
    };

    match CLAIMS_ENGINE
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(claims) => Ok(Some(claims)),
        None => {
            tracing::warn!("Undecodable claims challenge from {}", response.url());
            Err(Error::from(ResponseError::from_response(response)))
        }
    }
}

#[async_trait]
impl Policy for BearerTokenPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> Result<Response> {
        // Never put a token on a plaintext connection
        if request.url().scheme() != "https" {
            return Err(Error::InsecureTransport);
        }

        let original = request.clone();
        let published = self.authorization(ctx, None).await?;
        authorize(request, &published)?;

        let response = send_next(ctx, request, next).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(claims) = claims_challenge(&response)? else {
            return Ok(response);
        };

        tracing::debug!("Claims challenge from {}, refreshing bearer token", original.url());
        self.invalidate(&published);
        let refreshed = self.authorization(ctx, Some(&claims)).await?;
        *request = original;
        authorize(request, &refreshed)?;
        send_next(ctx, request, next).await
    }
}
