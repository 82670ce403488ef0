use std::sync::Arc;
use tillsync_replay::{CloudClient, CloudConfig, CloudError};
use tillsync_types::{CommandAction, DeviceId, RequestId};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> Arc<CloudClient> {
    Arc::new(CloudClient::new(CloudConfig::new(
        server.uri(),
        DeviceId::new(),
    )))
}

// ── Health probe ─────────────────────────────────────────────────

#[tokio::test]
async fn health_check_reports_reachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(client_for(&server).health_check().await);
}

#[tokio::test]
async fn health_check_reports_server_failure_as_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    assert!(!client_for(&server).health_check().await);
}

#[tokio::test]
async fn health_check_handles_no_server() {
    let client = Arc::new(CloudClient::new(CloudConfig::new(
        "http://127.0.0.1:1",
        DeviceId::new(),
    )));
    assert!(!client.health_check().await);
}

// ── Dispatch & headers ───────────────────────────────────────────

#[tokio::test]
async fn replayed_order_carries_the_replay_headers() {
    let server = MockServer::start().await;
    let rid = RequestId::new();
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .and(header("X-Idempotency-Key", rid.to_string()))
        .and(header("X-Offline-Replay", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "o-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client
        .replay(
            &CommandAction::CreateOrder {
                payload: serde_json::json!({"table": 3}),
            },
            rid,
        )
        .await
        .unwrap();
    assert_eq!(result["id"], "o-1");
}

#[tokio::test]
async fn live_order_is_not_flagged_as_a_replay() {
    let server = MockServer::start().await;
    let rid = RequestId::new();
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .and(header("X-Idempotency-Key", rid.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "o-2"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client
        .execute(
            &CommandAction::CreateOrder {
                payload: serde_json::json!({"table": 3}),
            },
            rid,
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("X-Offline-Replay"));
}

#[tokio::test]
async fn bearer_token_is_attached_when_set() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/inventory/adjustments"))
        .and(header("Authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.set_token(Some("tok-123".to_string())).await;
    client
        .execute(
            &CommandAction::AdjustInventory {
                payload: serde_json::json!({"sku": "beans", "delta": -2}),
            },
            RequestId::new(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn bump_hits_the_station_route_and_tolerates_empty_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/kds/runtime/grill/tickets/t-4/bump"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let result = client
        .execute(
            &CommandAction::BumpTicket {
                station: "grill".into(),
                ticket_id: "t-4".into(),
            },
            RequestId::new(),
        )
        .await
        .unwrap();
    assert!(result.is_null());
}

// ── Failure classification ───────────────────────────────────────

#[tokio::test]
async fn client_errors_are_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad payload"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .execute(
            &CommandAction::CreateOrder {
                payload: serde_json::json!({}),
            },
            RequestId::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::Rejected { status: 422, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .execute(
            &CommandAction::CreateOrder {
                payload: serde_json::json!({}),
            },
            RequestId::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::Server { status: 500 }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn connection_failures_are_retryable() {
    let client = Arc::new(CloudClient::new(CloudConfig::new(
        "http://127.0.0.1:1",
        DeviceId::new(),
    )));
    let err = client
        .execute(
            &CommandAction::CreateOrder {
                payload: serde_json::json!({}),
            },
            RequestId::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}
