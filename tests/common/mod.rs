//! Shared helpers for integration tests
#![allow(dead_code)]

use armcore::auth::{AccessToken, TokenCredential, TokenRequest};
use armcore::http::{
    HttpTransport, Method, Pipeline, Policy, Request, Response, RetryOptions, RetryPolicy,
    StatusCode,
};
use armcore::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Retries fast enough for tests; a server may still ask for up to 500ms
pub fn fast_retry() -> Arc<dyn Policy> {
    Arc::new(RetryPolicy::new(RetryOptions {
        max_retries: 3,
        retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(500),
    }))
}

/// Plain pipeline for talking to a wiremock server: retry and transport
pub fn wire_pipeline() -> Pipeline {
    let transport: Arc<dyn Policy> = Arc::new(HttpTransport::new().expect("transport"));
    Pipeline::new(vec![fast_retry(), transport])
}

/// One canned answer of a [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub struct Answer {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Answer {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = body.to_string();
        self
    }
}

/// A request as seen by a [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

/// In-process transport answering from a queue, so HTTPS URLs work without
/// a TLS server.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    answers: Mutex<VecDeque<Answer>>,
    seen: Mutex<Vec<Seen>>,
}

impl ScriptedTransport {
    pub fn new(answers: Vec<Answer>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            seen: Mutex::default(),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Policy for ScriptedTransport {
    async fn send(
        &self,
        _ctx: &Context,
        request: &mut Request,
        _next: &[Arc<dyn Policy>],
    ) -> Result<Response> {
        self.seen.lock().unwrap().push(Seen {
            method: request.method().clone(),
            url: request.url().to_string(),
            headers: request.headers().clone(),
        });
        let answer = self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request {} {}", request.method(), request.url()));

        let mut headers = HeaderMap::new();
        for (name, value) in &answer.headers {
            headers.insert(
                HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Ok(Response::new(
            StatusCode::from_u16(answer.status).unwrap(),
            headers,
            answer.body.into_bytes(),
            request.method().clone(),
            request.url().clone(),
        ))
    }
}

/// Hands out `static-token-<n>`, counting fetches
#[derive(Debug, Default)]
pub struct StaticCredential {
    fetches: AtomicUsize,
}

impl StaticCredential {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenCredential for StaticCredential {
    async fn get_token(&self, _ctx: &Context, request: &TokenRequest) -> Result<AccessToken> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let token = match &request.tenant_id {
            Some(tenant) => format!("{tenant}-token"),
            None => format!("static-token-{n}"),
        };
        Ok(AccessToken {
            token,
            expires_on: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }
}
