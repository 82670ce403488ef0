//! Edge-gateway WebSocket message types.

use serde::{Deserialize, Serialize};
use tillsync_types::{DeviceId, RequestId};

/// A message on the gateway WebSocket session, tagged with its wire
/// name in the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayMessage {
    /// Device announces itself after connecting.
    Register {
        device_id: DeviceId,
        device_name: String,
        venue_id: String,
    },

    /// Gateway accepted the registration.
    Registered,

    /// Periodic liveness signal from the device.
    Heartbeat {
        device_id: DeviceId,
        /// Local pending-queue depth, for the gateway's dashboard.
        pending_commands: u64,
    },

    /// Gateway acknowledged a heartbeat.
    HeartbeatAck,

    /// Gateway accepted a forwarded command into its durable queue.
    CommandQueued { request_id: RequestId },

    /// Gateway-side queue progress push.
    SyncStatus {
        pending: u64,
        synced: u64,
        failed: u64,
    },
}
