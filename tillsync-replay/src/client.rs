//! Cloud REST API client.
//!
//! Every mutating call carries the command's idempotency key so a
//! retried request produces a single server-side effect, plus the
//! device header the backend uses for audit. Requests draining the
//! offline queue are additionally flagged as replays.

use crate::error::{CloudError, CloudResult};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tillsync_types::{CommandAction, DeviceId, RequestId};
use tokio::sync::RwLock;
use tracing::debug;

/// Configuration for the cloud API client.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Base URL of the cloud backend (e.g. `https://api.example.com`).
    pub api_base_url: String,
    /// This device's ID, sent as `X-Device-Id`.
    pub device_id: DeviceId,
    /// Timeout for the health probe.
    pub health_timeout: Duration,
    /// Timeout for mutation requests.
    pub request_timeout: Duration,
}

impl CloudConfig {
    /// Creates a config with the default timeouts.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            device_id,
            health_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Cloud API client.
pub struct CloudClient {
    config: CloudConfig,
    client: Client,
    token: Arc<RwLock<Option<String>>>,
}

impl CloudClient {
    /// Creates a new cloud client.
    #[must_use]
    pub fn new(config: CloudConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to create HTTP client");
        Self {
            config,
            client,
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets the bearer token for subsequent requests (e.g. loaded from
    /// the offline auth cache).
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// This device's ID.
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.config.device_id
    }

    /// Cheap reachability probe: short-timeout GET to the health
    /// endpoint. Any response at all counts as reachable.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/health", self.config.api_base_url);
        match self
            .client
            .get(&url)
            .timeout(self.config.health_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("cloud health probe failed: {e}");
                false
            }
        }
    }

    /// Executes a command live against the cloud API, tagged with its
    /// idempotency key. Returns the server response body.
    pub async fn execute(
        &self,
        action: &CommandAction,
        request_id: RequestId,
    ) -> CloudResult<serde_json::Value> {
        self.send(action, request_id, false).await
    }

    /// Replays a previously queued command. Identical to
    /// [`CloudClient::execute`] except the request is flagged as an
    /// offline replay for the backend's audit trail.
    pub async fn replay(
        &self,
        action: &CommandAction,
        request_id: RequestId,
    ) -> CloudResult<serde_json::Value> {
        self.send(action, request_id, true).await
    }

    async fn send(
        &self,
        action: &CommandAction,
        request_id: RequestId,
        offline_replay: bool,
    ) -> CloudResult<serde_json::Value> {
        let base = &self.config.api_base_url;
        let (url, payload) = match action {
            CommandAction::CreateOrder { payload } => {
                (format!("{base}/api/pos/orders"), payload.clone())
            }
            CommandAction::AddOrderItem { order_id, payload } => (
                format!("{base}/api/pos/orders/{order_id}/items"),
                payload.clone(),
            ),
            CommandAction::RecordPayment { order_id, payload } => (
                format!("{base}/api/pos/orders/{order_id}/payments"),
                payload.clone(),
            ),
            CommandAction::BumpTicket { station, ticket_id } => (
                format!("{base}/api/kds/runtime/{station}/tickets/{ticket_id}/bump"),
                serde_json::Value::Null,
            ),
            CommandAction::AdjustInventory { payload } => (
                format!("{base}/api/inventory/adjustments"),
                payload.clone(),
            ),
        };

        let mut request = self
            .client
            .post(&url)
            .header("X-Idempotency-Key", request_id.to_string())
            .header("X-Device-Id", self.config.device_id.to_string())
            .json(&payload);

        if offline_replay {
            request = request.header("X-Offline-Replay", "true");
        }
        if let Some(token) = self.token.read().await.as_ref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CloudError::Timeout
            } else {
                CloudError::Http(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            // Some endpoints (bump) reply with an empty body.
            let body = response.bytes().await?;
            if body.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            Ok(serde_json::from_slice(&body)?)
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Err(CloudError::Rejected {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(CloudError::Server {
                status: status.as_u16(),
            })
        }
    }
}
