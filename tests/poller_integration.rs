//! Integration tests for long-running operation polling using wiremock
//!
//! Each test starts an operation against a mock server, then drives the
//! poller through the real HTTP transport.

mod common;

use armcore::http::{Method, Pipeline, Request, Response};
use armcore::lro::{default_error_handler, FinalResponse, Poller};
use armcore::{Context, Error, FinalStateVia};
use common::wire_pipeline;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FAST: Duration = Duration::from_millis(10);
const RESOURCE: &str = "/subscriptions/sub1/resourceGroups/rg/providers/Contoso.Widgets/widgets/w1";

async fn start(
    server: &MockServer,
    pipeline: &Pipeline,
    verb: Method,
    final_state: Option<FinalStateVia>,
) -> armcore::Result<Poller> {
    let response = initial(server, pipeline, verb).await;
    Poller::new(
        "widgets.Operation",
        final_state,
        response,
        pipeline.clone(),
        default_error_handler(),
    )
}

async fn initial(server: &MockServer, pipeline: &Pipeline, verb: Method) -> Response {
    let url = Url::parse(&format!("{}{}", server.uri(), RESOURCE)).unwrap();
    let mut request = Request::new(verb, url)
        .with_json(&json!({"properties": {"size": 3}}))
        .unwrap();
    pipeline.send(&Context::new(), &mut request).await.unwrap()
}

/// Azure-AsyncOperation PUT: status document polled, resource fetched at the end
#[tokio::test]
async fn test_async_put_polls_status_then_gets_resource() {
    let server = MockServer::start().await;
    let status_url = format!("{}/operations/op1", server.uri());

    Mock::given(method("PUT"))
        .and(path(RESOURCE))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Azure-AsyncOperation", status_url.as_str())
                .set_body_json(json!({"properties": {"provisioningState": "Creating"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "InProgress"})))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Succeeded"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "w1",
            "properties": {"provisioningState": "Succeeded", "size": 3}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::PUT, None).await.unwrap();
    assert_eq!(poller.kind(), "async");
    assert_eq!(poller.status().as_str(), "Creating");

    let result: FinalResponse<Value> = poller.poll_until_done(&Context::new(), FAST).await.unwrap();
    assert!(poller.status().is_success());
    assert_eq!(result.value.unwrap()["properties"]["size"], 3);
}

/// Location DELETE: 202 until the operation ends with 204
#[tokio::test]
async fn test_location_delete_until_no_content() {
    let server = MockServer::start().await;
    let location = format!("{}/operationResults/del1", server.uri());

    Mock::given(method("DELETE"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", location.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operationResults/del1"))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", location.as_str()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operationResults/del1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::DELETE, None).await.unwrap();
    assert_eq!(poller.kind(), "loc");

    let response = poller.poll_until_done_raw(&Context::new(), FAST).await.unwrap();
    assert_eq!(response.status().as_u16(), 204);
}

/// Location POST: the payload arrives on the terminal poll itself
#[tokio::test]
async fn test_location_post_payload_on_terminal_poll() {
    let server = MockServer::start().await;
    let location = format!("{}/operationResults/post1", server.uri());

    Mock::given(method("POST"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", location.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operationResults/post1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": ["k1", "k2"]})))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::POST, Some(FinalStateVia::Location))
        .await
        .unwrap();

    let result: FinalResponse<Value> = poller.poll_until_done(&Context::new(), FAST).await.unwrap();
    assert_eq!(result.value.unwrap()["keys"][1], "k2");
}

/// Provisioning-state PATCH: the resource itself is polled
#[tokio::test]
async fn test_body_patch_polls_resource() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path(RESOURCE))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"properties": {"provisioningState": "Updating"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"properties": {"provisioningState": "Updating"}})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "w1",
            "properties": {"provisioningState": "Succeeded"}
        })))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::PATCH, None).await.unwrap();
    assert_eq!(poller.kind(), "body");

    let result: FinalResponse<Value> = poller.poll_until_done(&Context::new(), FAST).await.unwrap();
    assert_eq!(result.value.unwrap()["name"], "w1");
}

/// PUT answered synchronously with 200 and no body is already done
#[tokio::test]
async fn test_synchronous_put_completes_without_polling() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::PUT, None).await.unwrap();
    assert!(poller.done());
    assert_eq!(poller.status().as_str(), "Succeeded");

    let result: FinalResponse<Value> = poller.poll_until_done(&Context::new(), FAST).await.unwrap();
    assert!(result.value.is_none());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

/// A 202 to DELETE without any polling header violates the protocol
#[tokio::test]
async fn test_accepted_without_polling_url_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let err = start(&server, &pipeline, Method::DELETE, None).await.unwrap_err();
    assert_eq!(err.to_string(), "response is missing polling URL");
}

/// A failed operation surfaces the service error through the error handler
#[tokio::test]
async fn test_failed_operation_returns_service_error() {
    let server = MockServer::start().await;
    let status_url = format!("{}/operations/op-fail", server.uri());

    Mock::given(method("PUT"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(201).insert_header("Azure-AsyncOperation", status_url.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-fail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Failed",
            "error": {"code": "QuotaExceeded", "message": "no more widgets"}
        })))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::PUT, None).await.unwrap();

    let err = poller
        .poll_until_done_raw(&Context::new(), FAST)
        .await
        .unwrap_err();
    match err {
        Error::Response(err) => {
            assert_eq!(err.error_code.as_deref(), Some("QuotaExceeded"));
            assert_eq!(err.message.as_deref(), Some("no more widgets"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(poller.done());
}

/// Retry-After on the initial response delays the first poll
#[tokio::test]
async fn test_initial_retry_after_is_honored() {
    let server = MockServer::start().await;
    let location = format!("{}/operationResults/slow", server.uri());

    Mock::given(method("DELETE"))
        .and(path(RESOURCE))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", location.as_str())
                .insert_header("retry-after-ms", "150"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operationResults/slow"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::DELETE, None).await.unwrap();

    let started = std::time::Instant::now();
    poller.poll_until_done_raw(&Context::new(), FAST).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
}

/// A resume token picks up polling where the first poller stopped
#[tokio::test]
async fn test_resume_from_token() {
    let server = MockServer::start().await;
    let status_url = format!("{}/operations/op-resume", server.uri());

    Mock::given(method("PUT"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(201).insert_header("Azure-AsyncOperation", status_url.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-resume"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Succeeded"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "w1"})))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let poller = start(&server, &pipeline, Method::PUT, None).await.unwrap();
    let token = poller.resume_token().unwrap();
    drop(poller);

    let mismatched = Poller::from_resume_token(
        "widgets.Other",
        &token,
        pipeline.clone(),
        default_error_handler(),
    );
    assert!(matches!(mismatched, Err(Error::ResumeToken(_))));

    let mut resumed =
        Poller::from_resume_token("widgets.Operation", &token, pipeline, default_error_handler())
            .unwrap();
    let result: FinalResponse<Value> = resumed.poll_until_done(&Context::new(), FAST).await.unwrap();
    assert_eq!(result.value.unwrap()["name"], "w1");
}

/// Cancelling the context interrupts the delay between polls
#[tokio::test]
async fn test_cancel_during_poll_delay() {
    let server = MockServer::start().await;
    let location = format!("{}/operationResults/forever", server.uri());

    Mock::given(method("DELETE"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(202).insert_header("Location", location.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operationResults/forever"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::DELETE, None).await.unwrap();

    let ctx = Context::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = poller
        .poll_until_done_raw(&ctx, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!poller.done());
}

/// Throttled polls are retried by the pipeline, not seen by the poller
#[tokio::test]
async fn test_throttled_poll_is_retried() {
    let server = MockServer::start().await;
    let status_url = format!("{}/operations/op-throttle", server.uri());

    Mock::given(method("DELETE"))
        .and(path(RESOURCE))
        .respond_with(ResponseTemplate::new(202).insert_header("Azure-AsyncOperation", status_url.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-throttle"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after-ms", "10"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/operations/op-throttle"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "Succeeded"})))
        .mount(&server)
        .await;

    let pipeline = wire_pipeline();
    let mut poller = start(&server, &pipeline, Method::DELETE, None).await.unwrap();
    let response = poller.poll_until_done_raw(&Context::new(), FAST).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
}
