//! Core querier: version negotiation, rate-limit retries and host failover

mod common;

use std::time::Duration;

use common::{MockCore, test_config};
use pretty_assertions::assert_eq;
use serde_json::json;
use supertokens_session::querier::{CoreQuerier, RetryConfig};
use supertokens_session::{GeneralError, SessionConfig, SessionError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

#[tokio::test]
async fn test_concurrent_calls_have_independent_retry_budgets() {
    let core = MockCore::start().await;
    Mock::given(method("GET"))
        .and(path("/recipe/limited"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&core.server)
        .await;

    let querier = CoreQuerier::new(&test_config(&core))
        .unwrap()
        .with_retry(fast_retry(5));

    let (first, second) = tokio::join!(
        querier.send_get("/recipe/limited", &[]),
        querier.send_get("/recipe/limited", &[]),
    );

    for result in [first, second] {
        match result.unwrap_err() {
            SessionError::General(GeneralError::CoreStatus { status, .. }) => {
                assert_eq!(status, 429);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(core.requests_to("/recipe/limited").await.len(), 12);
}

#[tokio::test]
async fn test_rate_limit_recovers_within_budget() {
    let core = MockCore::start().await;
    Mock::given(method("GET"))
        .and(path("/recipe/flaky"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&core.server)
        .await;
    core.mount_json("GET", "/recipe/flaky", json!({"status": "OK"}))
        .await;

    let querier = CoreQuerier::new(&test_config(&core))
        .unwrap()
        .with_retry(fast_retry(5));

    let body = querier.send_get("/recipe/flaky", &[]).await.unwrap();
    assert_eq!(body, json!({"status": "OK"}));
    assert_eq!(core.requests_to("/recipe/flaky").await.len(), 3);
}

#[tokio::test]
async fn test_api_version_is_negotiated_once() {
    let core = MockCore::start().await;
    core.mount_json("GET", "/recipe/ping", json!({"status": "OK"}))
        .await;
    let querier = CoreQuerier::new(&test_config(&core)).unwrap();

    for _ in 0..3 {
        querier.send_get("/recipe/ping", &[]).await.unwrap();
    }

    assert_eq!(querier.api_version().await.unwrap(), "5.0");
    assert_eq!(core.requests_to("/apiversion").await.len(), 1);
    let requests = core.requests_to("/recipe/ping").await;
    assert!(requests.iter().all(|request| {
        request.headers.get("cdi-version").is_some_and(|v| v == "5.0")
    }));
}

#[tokio::test]
async fn test_no_common_version_is_a_config_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/apiversion"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"versions": ["1.0"]})))
        .mount(&server)
        .await;
    let querier = CoreQuerier::new(&SessionConfig::new(
        server.uri(),
        "http://localhost:3001",
        "http://localhost:3000",
    ))
    .unwrap();

    let err = querier.send_get("/recipe/ping", &[]).await.unwrap_err();
    assert!(matches!(err, SessionError::General(GeneralError::Config(_))));
}

#[tokio::test]
async fn test_unreachable_host_is_skipped() {
    let core = MockCore::start().await;
    core.mount_json("GET", "/recipe/ping", json!({"status": "OK"}))
        .await;
    let config = SessionConfig::new(
        format!("http://127.0.0.1:1;{}", core.uri()),
        "http://localhost:3001",
        "http://localhost:3000",
    );
    let querier = CoreQuerier::new(&config).unwrap();
    assert_eq!(querier.hosts().len(), 2);

    let body = querier.send_get("/recipe/ping", &[]).await.unwrap();
    assert_eq!(body, json!({"status": "OK"}));
}

#[tokio::test]
async fn test_api_key_header_is_sent() {
    let core = MockCore::start().await;
    core.mount_json("GET", "/recipe/ping", json!({"status": "OK"}))
        .await;
    let querier = CoreQuerier::new(&test_config(&core).with_api_key("secret-key")).unwrap();

    querier.send_get("/recipe/ping", &[]).await.unwrap();

    let requests = core.requests_to("/recipe/ping").await;
    assert_eq!(requests[0].headers.get("api-key").unwrap(), "secret-key");
    assert_eq!(requests[0].headers.get("rid").unwrap(), "session");
}

#[tokio::test]
async fn test_delete_sends_query() {
    let core = MockCore::start().await;
    core.mount_json("DELETE", "/recipe/thing", json!({"status": "OK"}))
        .await;
    let querier = CoreQuerier::new(&test_config(&core)).unwrap();

    querier
        .send_delete("/recipe/thing", &[("id", "42")])
        .await
        .unwrap();

    let requests = core.requests_to("/recipe/thing").await;
    assert_eq!(requests[0].url.query(), Some("id=42"));
}

#[test]
fn test_empty_connection_uri_is_rejected() {
    let config = SessionConfig::new(" ; ", "http://localhost:3001", "http://localhost:3000");
    assert!(CoreQuerier::new(&config).is_err());
}
