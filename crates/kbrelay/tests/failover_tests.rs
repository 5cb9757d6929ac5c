//! Integration tests for primary/backup credential failover
//!
//! The completion provider is a wiremock server; mocks are matched on the
//! bearer token so each credential's calls can be counted.

use bytes::Bytes;
use serde_json::json;
use std::time::Duration;
use url::Url;
use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

use kbrelay::RelayError;
use kbrelay::proxy::{CredentialSet, CredentialSlot, FailoverDispatcher};

// =============================================================================
// Test Fixtures
// =============================================================================

const COMPLETION_PATH: &str = "/api/v1/chat/completions";

fn dispatcher(server: &MockServer, backup: Option<&str>, timeout: Duration) -> FailoverDispatcher {
    let client = reqwest::Client::builder().timeout(timeout).build().unwrap();
    let endpoint = Url::parse(&format!("{}{COMPLETION_PATH}", server.uri())).unwrap();
    FailoverDispatcher::new(
        client,
        endpoint,
        CredentialSet::new("primary", backup.map(str::to_string)),
    )
}

fn request_body() -> Bytes {
    Bytes::from(
        json!({
            "model": "openai/gpt-oss-20b:free",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        })
        .to_string(),
    )
}

fn with_key(key: &str) -> wiremock::MockBuilder {
    Mock::given(matchers::method("POST"))
        .and(matchers::path(COMPLETION_PATH))
        .and(matchers::header("authorization", format!("Bearer {key}").as_str()))
}

// =============================================================================
// Success paths
// =============================================================================

#[tokio::test]
async fn test_primary_success_makes_one_call() {
    let server = MockServer::start().await;
    with_key("primary")
        .and(matchers::header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ok"})))
        .expect(1)
        .mount(&server)
        .await;
    with_key("backup")
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server, Some("backup"), Duration::from_secs(5))
        .send(request_body())
        .await
        .unwrap();

    assert_eq!(outcome.served_by, CredentialSlot::Primary);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.response.status(), 200);
}

#[tokio::test]
async fn test_rate_limited_primary_fails_over_to_backup() {
    let server = MockServer::start().await;
    with_key("primary")
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(1)
        .mount(&server)
        .await;
    with_key("backup")
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "from-backup"})))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server, Some("backup"), Duration::from_secs(5))
        .send(request_body())
        .await
        .unwrap();

    assert_eq!(outcome.served_by, CredentialSlot::Backup);
    assert_eq!(outcome.attempts, 2);
    let body: serde_json::Value = outcome.response.json().await.unwrap();
    assert_eq!(body["id"], "from-backup");
}

#[tokio::test]
async fn test_backup_receives_identical_body() {
    let server = MockServer::start().await;
    with_key("primary")
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    with_key("backup")
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    dispatcher(&server, Some("backup"), Duration::from_secs(5))
        .send(request_body())
        .await
        .unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].body, received[1].body);
    assert_eq!(received[1].body, request_body().to_vec());
}

#[tokio::test]
async fn test_transport_failure_fails_over_to_backup() {
    let server = MockServer::start().await;
    with_key("primary")
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;
    with_key("backup")
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "from-backup"})))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server, Some("backup"), Duration::from_millis(300))
        .send(request_body())
        .await
        .unwrap();

    assert_eq!(outcome.served_by, CredentialSlot::Backup);
}

// =============================================================================
// Pass-through and exhaustion
// =============================================================================

#[tokio::test]
async fn test_rate_limit_without_backup_is_returned_unchanged() {
    let server = MockServer::start().await;
    with_key("primary")
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"error": {"message": "Rate limit exceeded", "code": 429}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server, None, Duration::from_secs(5))
        .send(request_body())
        .await
        .unwrap();

    assert_eq!(outcome.response.status(), 429);
    let body: serde_json::Value = outcome.response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Rate limit exceeded");
}

#[tokio::test]
async fn test_non_retryable_error_is_not_failed_over() {
    let server = MockServer::start().await;
    with_key("primary")
        .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
        .expect(1)
        .mount(&server)
        .await;
    with_key("backup")
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let outcome = dispatcher(&server, Some("backup"), Duration::from_secs(5))
        .send(request_body())
        .await
        .unwrap();

    assert_eq!(outcome.response.status(), 400);
    assert_eq!(outcome.response.text().await.unwrap(), "bad model");
}

#[tokio::test]
async fn test_backup_failure_is_upstream_exhausted() {
    let server = MockServer::start().await;
    with_key("primary")
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;
    with_key("backup")
        .respond_with(ResponseTemplate::new(500).set_body_string("provider down"))
        .expect(1)
        .mount(&server)
        .await;

    let err = dispatcher(&server, Some("backup"), Duration::from_secs(5))
        .send(request_body())
        .await
        .unwrap_err();

    match err {
        RelayError::UpstreamExhausted { status, reason } => {
            assert_eq!(status, Some(500));
            assert!(reason.contains("provider down"));
        }
        other => panic!("expected UpstreamExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transport_failure_without_backup_is_upstream_exhausted() {
    let server = MockServer::start().await;
    with_key("primary")
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let err = dispatcher(&server, None, Duration::from_millis(200))
        .send(request_body())
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::UpstreamExhausted { status: None, .. }));
    assert!(err.to_string().contains("timed out"));
}
