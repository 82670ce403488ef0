use pretty_assertions::assert_eq;
use std::sync::Arc;
use tillsync_gateway::{GatewayClient, GatewayConfig, GatewaySession};
use tillsync_mesh::{MeshClient, MeshConfig};
use tillsync_orchestrator::{
    decide_mode, OrchestratorConfig, ResilienceOrchestrator, SubmitOutcome,
};
use tillsync_replay::{CloudClient, CloudConfig, ReplayConfig, ReplayEngine};
use tillsync_store::StoreHandle;
use tillsync_types::{CommandAction, CommandStatus, DeviceId, DeviceType, ResilienceMode};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Nothing listens here; probes fail fast with connection refused.
const DEAD_CLOUD: &str = "http://127.0.0.1:9";

async fn build(
    cloud_url: &str,
    edge_url: Option<&str>,
) -> (ResilienceOrchestrator, StoreHandle) {
    let store = StoreHandle::in_memory().await;
    let device_id = DeviceId::new();
    let cloud = Arc::new(CloudClient::new(CloudConfig::new(cloud_url, device_id)));
    let replay = ReplayEngine::new(store.clone(), cloud.clone(), ReplayConfig::default());
    let gateway_config = match edge_url {
        Some(url) => GatewayConfig::with_endpoint(url, "venue-1", device_id),
        None => GatewayConfig::disabled("venue-1", device_id),
    };
    let gateway = GatewayClient::new(gateway_config.clone());
    let session = GatewaySession::new(gateway_config);
    let mesh = MeshClient::new(
        MeshConfig::disabled(device_id, DeviceType::Tablet),
        store.clone(),
    );
    let orchestrator = ResilienceOrchestrator::new(
        OrchestratorConfig::default(),
        store.clone(),
        cloud,
        replay,
        gateway,
        session,
        mesh,
    );
    (orchestrator, store)
}

fn create_order() -> CommandAction {
    CommandAction::CreateOrder {
        payload: serde_json::json!({"table": 4, "items": []}),
    }
}

// ── Decision table ───────────────────────────────────────────────

#[test]
fn precedence_is_strict() {
    // Cloud beats everything, even a perfectly healthy edge gateway.
    assert_eq!(decide_mode(true, true, true, 3), ResilienceMode::Online);
    // Edge beats an active mesh with peers.
    assert_eq!(decide_mode(false, true, true, 2), ResilienceMode::Edge);
    // Mesh needs at least one peer to be worth anything.
    assert_eq!(decide_mode(false, false, true, 2), ResilienceMode::Mesh);
    assert_eq!(decide_mode(false, false, true, 0), ResilienceMode::Device);
    assert_eq!(decide_mode(false, false, false, 0), ResilienceMode::Device);
}

// ── Mode evaluation ──────────────────────────────────────────────

#[tokio::test]
async fn healthy_cloud_resolves_to_online() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (orchestrator, _store) = build(&server.uri(), None).await;
    assert_eq!(orchestrator.status().mode, ResilienceMode::Unknown);

    orchestrator.evaluate_now().await;
    let status = orchestrator.status();
    assert_eq!(status.mode, ResilienceMode::Online);
    assert!(status.cloud_reachable);
    assert!(!status.edge_reachable);
}

#[tokio::test]
async fn dead_cloud_with_healthy_edge_resolves_to_edge() {
    let edge = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&edge)
        .await;

    let (orchestrator, _store) = build(DEAD_CLOUD, Some(&edge.uri())).await;
    orchestrator.evaluate_now().await;
    let status = orchestrator.status();
    assert_eq!(status.mode, ResilienceMode::Edge);
    assert!(!status.cloud_reachable);
    assert!(status.edge_reachable);
    orchestrator.stop();
}

#[tokio::test]
async fn everything_down_resolves_to_device() {
    let (orchestrator, _store) = build(DEAD_CLOUD, None).await;
    orchestrator.evaluate_now().await;
    assert_eq!(orchestrator.status().mode, ResilienceMode::Device);
}

#[tokio::test]
async fn status_watch_publishes_every_evaluation() {
    let (orchestrator, _store) = build(DEAD_CLOUD, None).await;
    let mut rx = orchestrator.watch_status();
    orchestrator.evaluate_now().await;
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().mode, ResilienceMode::Device);
}

// ── Submission routing ───────────────────────────────────────────

#[tokio::test]
async fn submit_before_first_evaluation_queues_locally() {
    let (orchestrator, store) = build(DEAD_CLOUD, None).await;

    let outcome = orchestrator.submit(create_order()).await;
    let SubmitOutcome::Queued {
        request_id,
        placeholder_id,
    } = outcome
    else {
        panic!("expected a queued outcome");
    };
    assert_eq!(
        placeholder_id.as_deref(),
        Some(request_id.placeholder().as_str())
    );

    let pending = store.pending_commands().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, request_id);
    assert_eq!(pending[0].status, CommandStatus::Pending);
}

#[tokio::test]
async fn online_submit_executes_directly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "order-773"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (orchestrator, store) = build(&server.uri(), None).await;
    orchestrator.evaluate_now().await;

    let outcome = orchestrator.submit(create_order()).await;
    let SubmitOutcome::Completed { result } = outcome else {
        panic!("expected a direct cloud outcome");
    };
    assert_eq!(result["id"], "order-773");
    assert!(store.pending_commands().await.is_empty());
}

#[tokio::test]
async fn online_submit_falls_through_to_the_queue_on_cloud_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let (orchestrator, store) = build(&server.uri(), None).await;
    orchestrator.evaluate_now().await;

    let outcome = orchestrator.submit(create_order()).await;
    assert!(outcome.is_queued());
    assert_eq!(store.pending_commands().await.len(), 1);
}

#[tokio::test]
async fn edge_submit_forwards_to_the_gateway_queue() {
    let edge = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&edge)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/queue/enqueue"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&edge)
        .await;

    let (orchestrator, store) = build(DEAD_CLOUD, Some(&edge.uri())).await;
    orchestrator.evaluate_now().await;
    assert_eq!(orchestrator.status().mode, ResilienceMode::Edge);

    let outcome = orchestrator.submit(create_order()).await;
    assert!(matches!(outcome, SubmitOutcome::Forwarded { .. }));
    // Forwarded commands live in the gateway's queue, not ours.
    assert!(store.pending_commands().await.is_empty());
    orchestrator.stop();
}

#[tokio::test]
async fn edge_submit_falls_through_when_the_gateway_rejects() {
    let edge = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&edge)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/queue/enqueue"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&edge)
        .await;

    let (orchestrator, store) = build(DEAD_CLOUD, Some(&edge.uri())).await;
    orchestrator.evaluate_now().await;

    let outcome = orchestrator.submit(create_order()).await;
    assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
    assert_eq!(store.pending_commands().await.len(), 1);
    orchestrator.stop();
}

#[tokio::test]
async fn edge_evaluation_drains_the_local_queue_through_the_gateway() {
    let edge = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&edge)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/queue/enqueue"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&edge)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/queue/sync"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&edge)
        .await;

    let (orchestrator, store) = build(DEAD_CLOUD, Some(&edge.uri())).await;
    // Two orders taken while nothing was reachable.
    assert!(orchestrator.submit(create_order()).await.is_queued());
    assert!(orchestrator.submit(create_order()).await.is_queued());
    assert_eq!(store.pending_commands().await.len(), 2);

    orchestrator.evaluate_now().await;
    let status = orchestrator.status();
    assert_eq!(status.mode, ResilienceMode::Edge);
    // The gateway's durable queue owns them now.
    assert!(store.pending_commands().await.is_empty());
    assert_eq!(status.pending_commands, 0);
    orchestrator.stop();
}

#[tokio::test]
async fn edge_drain_keeps_commands_local_when_the_gateway_refuses() {
    let edge = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&edge)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/queue/enqueue"))
        .respond_with(ResponseTemplate::new(507))
        .mount(&edge)
        .await;

    let (orchestrator, store) = build(DEAD_CLOUD, Some(&edge.uri())).await;
    assert!(orchestrator.submit(create_order()).await.is_queued());

    orchestrator.evaluate_now().await;
    assert_eq!(orchestrator.status().mode, ResilienceMode::Edge);
    assert_eq!(store.pending_commands().await.len(), 1);
    orchestrator.stop();
}

// ── Offline-then-recovery scenario ───────────────────────────────

#[tokio::test]
async fn queued_order_syncs_once_the_cloud_returns() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "order-901"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Network down: the order is queued, not sent.
    let (orchestrator, store) = build(&server.uri(), None).await;
    let outcome = orchestrator.submit(create_order()).await;
    assert!(outcome.is_queued());
    assert_eq!(store.pending_commands().await.len(), 1);

    // Network restored: the next forced cycle drains the queue.
    let report = orchestrator.sync_now().await;
    assert_eq!(report.synced, 1);
    assert!(store.pending_commands().await.is_empty());
}

// ── Teardown ─────────────────────────────────────────────────────

#[tokio::test]
async fn stop_halts_the_replay_engine() {
    let (orchestrator, _store) = build(DEAD_CLOUD, None).await;
    orchestrator.start();
    orchestrator.stop();
    // A second stop is harmless.
    orchestrator.stop();
}
