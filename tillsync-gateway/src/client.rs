//! HTTP side of the edge-gateway client.
//!
//! The probe is gated by explicit configuration: with no gateway
//! endpoint configured, reachability is always false and no request is
//! ever made. This avoids false positives from development machines
//! that happen to run something on the default port.

use crate::error::{GatewayError, GatewayResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tillsync_types::{DeviceId, NewCommand};
use tracing::debug;

/// Configuration for the edge-gateway client.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the venue's edge gateway. `None` disables the
    /// client entirely.
    pub base_url: Option<String>,
    /// Venue this device belongs to.
    pub venue_id: String,
    /// This device's ID.
    pub device_id: DeviceId,
    /// Human-readable device name, sent on registration.
    pub device_name: String,
    /// Timeout for the health probe.
    pub probe_timeout: Duration,
    /// Heartbeat period on the WebSocket session.
    pub heartbeat_interval: Duration,
    /// Fixed delay before reconnecting a closed session.
    pub reconnect_delay: Duration,
}

impl GatewayConfig {
    /// A disabled config: no endpoint, probes short-circuit to false.
    #[must_use]
    pub fn disabled(venue_id: impl Into<String>, device_id: DeviceId) -> Self {
        Self {
            base_url: None,
            venue_id: venue_id.into(),
            device_id,
            device_name: "POS Device".to_string(),
            probe_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }

    /// A config pointing at a gateway endpoint.
    #[must_use]
    pub fn with_endpoint(
        base_url: impl Into<String>,
        venue_id: impl Into<String>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::disabled(venue_id, device_id)
        }
    }

    /// The WebSocket endpoint derived from the base URL.
    #[must_use]
    pub fn ws_url(&self) -> Option<String> {
        let base = self.base_url.as_ref()?;
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.clone()
        };
        Some(format!("{ws}/ws"))
    }
}

/// Gateway-side queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayQueueStats {
    pub pending: u64,
    pub synced: u64,
    pub failed: u64,
}

/// HTTP client for the edge gateway.
pub struct GatewayClient {
    config: GatewayConfig,
    client: Client,
}

impl GatewayClient {
    /// Creates a new gateway client.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");
        Self { config, client }
    }

    /// The client's configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Whether a gateway endpoint is configured at all.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.config.base_url.is_some()
    }

    fn base(&self) -> GatewayResult<&str> {
        self.config
            .base_url
            .as_deref()
            .ok_or(GatewayError::NotConfigured)
    }

    /// Cheap reachability probe. Always false when unconfigured, with
    /// no network I/O at all.
    pub async fn probe_health(&self) -> bool {
        let Ok(base) = self.base() else {
            return false;
        };
        match self
            .client
            .get(format!("{base}/health"))
            .timeout(self.config.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("edge gateway probe failed: {e}");
                false
            }
        }
    }

    async fn get_cached(&self, kind: &str) -> GatewayResult<serde_json::Value> {
        let base = self.base()?;
        let url = format!("{base}/api/cache/{kind}/{}", self.config.venue_id);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    /// Menu data from the gateway's own cache.
    pub async fn menu(&self) -> GatewayResult<serde_json::Value> {
        self.get_cached("menu").await
    }

    /// Product data from the gateway's own cache.
    pub async fn products(&self) -> GatewayResult<serde_json::Value> {
        self.get_cached("products").await
    }

    /// User data from the gateway's own cache.
    pub async fn users(&self) -> GatewayResult<serde_json::Value> {
        self.get_cached("users").await
    }

    /// Hands a mutation to the gateway's durable queue instead of the
    /// local store.
    pub async fn enqueue_command(&self, command: &NewCommand) -> GatewayResult<()> {
        let base = self.base()?;
        let resp = self
            .client
            .post(format!("{base}/api/queue/enqueue"))
            .json(command)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    /// Gateway-side queue statistics.
    pub async fn queue_stats(&self) -> GatewayResult<GatewayQueueStats> {
        let base = self.base()?;
        let resp = self
            .client
            .get(format!("{base}/api/queue/stats"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }

    /// Asks the gateway to drain its queue against the cloud now.
    pub async fn trigger_sync(&self) -> GatewayResult<()> {
        let base = self.base()?;
        let resp = self
            .client
            .post(format!("{base}/api/queue/sync"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GatewayError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}
