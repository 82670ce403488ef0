use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tillsync_replay::{CloudClient, CloudConfig, ReplayConfig, ReplayEngine};
use tillsync_store::StoreHandle;
use tillsync_types::{CommandAction, CommandStatus, DeviceId, NewCommand, RequestId};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn engine_for(server: &MockServer) -> (ReplayEngine, StoreHandle) {
    let store = StoreHandle::in_memory().await;
    let client = Arc::new(CloudClient::new(CloudConfig::new(
        server.uri(),
        DeviceId::new(),
    )));
    let engine = ReplayEngine::new(store.clone(), client, ReplayConfig::default());
    (engine, store)
}

fn order(device: DeviceId) -> NewCommand {
    NewCommand::local(
        CommandAction::CreateOrder {
            payload: serde_json::json!({"table": 2}),
        },
        device,
    )
}

// ── Success path ─────────────────────────────────────────────────

#[tokio::test]
async fn queued_command_syncs_on_replay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "o-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let device = DeviceId::new();
    let cmd = store.add_command(order(device)).await.unwrap();

    let report = engine.sync_now().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.synced, 1);

    let stored = store.command_by_request_id(cmd.request_id).await.unwrap();
    assert_eq!(stored.status, CommandStatus::Synced);
    assert!(stored.synced_at.is_some());
    assert_eq!(stored.result, Some(serde_json::json!({"id": "o-1"})));

    let log = store.sync_log_for(cmd.id).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, CommandStatus::Synced);

    // The create's server ID is now available for dependents.
    assert_eq!(
        store
            .resolve_placeholder(&cmd.request_id.placeholder())
            .await
            .as_deref(),
        Some("o-1")
    );
}

#[tokio::test]
async fn replay_is_fifo() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "x"})))
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let device = DeviceId::new();
    let first = store.add_command(order(device)).await.unwrap();
    let second = store.add_command(order(device)).await.unwrap();

    engine.sync_now().await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let keys: Vec<_> = requests
        .iter()
        .map(|r| r.headers["X-Idempotency-Key"].to_str().unwrap().to_string())
        .collect();
    assert_eq!(
        keys,
        vec![first.request_id.to_string(), second.request_id.to_string()]
    );
}

// ── Idempotency ──────────────────────────────────────────────────

#[tokio::test]
async fn retries_reuse_the_same_idempotency_key() {
    let server = MockServer::start().await;
    // First attempt fails as if the ack was lost; the retry must carry
    // the identical key so the backend can deduplicate.
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "o-1"})))
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let cmd = store.add_command(order(DeviceId::new())).await.unwrap();

    engine.sync_now().await;
    engine.sync_now().await;

    let stored = store.command_by_request_id(cmd.request_id).await.unwrap();
    assert_eq!(stored.status, CommandStatus::Synced);
    assert_eq!(stored.retry_count, 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let keys: Vec<_> = requests
        .iter()
        .map(|r| r.headers["X-Idempotency-Key"].to_str().unwrap())
        .collect();
    assert_eq!(keys[0], keys[1]);
    assert_eq!(keys[0], cmd.request_id.to_string());
}

// ── Retry cap ────────────────────────────────────────────────────

#[tokio::test]
async fn three_retryable_failures_reach_failed_terminally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let cmd = store.add_command(order(DeviceId::new())).await.unwrap();

    for _ in 0..3 {
        engine.sync_now().await;
    }
    let stored = store.command_by_request_id(cmd.request_id).await.unwrap();
    assert_eq!(stored.status, CommandStatus::Failed);
    assert_eq!(stored.retry_count, 3);

    // A fourth cycle must not attempt the failed command again.
    let report = engine.sync_now().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn rejected_commands_fail_immediately_without_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(422).set_body_string("no such table"))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let cmd = store.add_command(order(DeviceId::new())).await.unwrap();

    let report = engine.sync_now().await;
    assert_eq!(report.failed, 1);

    let stored = store.command_by_request_id(cmd.request_id).await.unwrap();
    assert_eq!(stored.status, CommandStatus::Failed);
    assert_eq!(stored.retry_count, 0, "validation failures burn no retry budget");

    let log = store.sync_log_for(cmd.id).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, CommandStatus::Failed);
}

// ── Offline-ID remapping ─────────────────────────────────────────

#[tokio::test]
async fn dependent_commands_are_rewritten_after_the_create_syncs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "o-9"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders/o-9/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let device = DeviceId::new();

    let create = NewCommand::local(
        CommandAction::CreateOrder {
            payload: serde_json::json!({"table": 5}),
        },
        device,
    );
    let placeholder = create.request_id.placeholder();
    store.add_command(create).await.unwrap();
    let item = store
        .add_command(NewCommand::local(
            CommandAction::AddOrderItem {
                order_id: placeholder,
                payload: serde_json::json!({"sku": "latte"}),
            },
            device,
        ))
        .await
        .unwrap();

    // FIFO: the create syncs first and records its server ID, so the
    // dependent resolves within the same cycle.
    let report = engine.sync_now().await;
    assert_eq!(report.synced, 2);

    let stored = store.command_by_request_id(item.request_id).await.unwrap();
    assert_eq!(stored.status, CommandStatus::Synced);
}

#[tokio::test]
async fn dependents_wait_for_their_create_without_burning_retries() {
    let server = MockServer::start().await;
    // The create keeps failing; its dependent must not be attempted.
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let device = DeviceId::new();
    let create = NewCommand::local(
        CommandAction::CreateOrder {
            payload: serde_json::json!({}),
        },
        device,
    );
    let placeholder = create.request_id.placeholder();
    store.add_command(create).await.unwrap();
    let item = store
        .add_command(NewCommand::local(
            CommandAction::AddOrderItem {
                order_id: placeholder,
                payload: serde_json::json!({"sku": "tea"}),
            },
            device,
        ))
        .await
        .unwrap();

    let report = engine.sync_now().await;
    assert_eq!(report.deferred, 2);

    let stored = store.command_by_request_id(item.request_id).await.unwrap();
    assert_eq!(stored.status, CommandStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    // Only the create ever reached the wire.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

// ── Online signal ────────────────────────────────────────────────

#[tokio::test]
async fn going_online_forces_a_cycle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/pos/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "o-1"})))
        .mount(&server)
        .await;

    let (engine, store) = engine_for(&server).await;
    let cmd = store.add_command(order(DeviceId::new())).await.unwrap();

    engine.start();
    assert!(engine.is_running());
    engine.set_online(true);

    // The forced cycle runs on the engine task; poll for the outcome.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = store.command_by_request_id(cmd.request_id).await.unwrap();
        if stored.status == CommandStatus::Synced {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "command never synced after going online"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    engine.stop();
    assert!(!engine.is_running());
}
