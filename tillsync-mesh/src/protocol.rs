//! Mesh WebSocket message types.

use serde::{Deserialize, Serialize};
use tillsync_types::{DeviceId, DeviceType, NewCommand, PeerInfo, RequestId};

/// A message on the mesh WebSocket, tagged with its wire name in the
/// `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshMessage {
    /// Device announces itself to the mesh after connecting.
    MeshJoin {
        device_id: DeviceId,
        device_name: String,
        device_type: DeviceType,
        score: u32,
    },

    /// Mesh accepted the join. Carries the current hub if one has
    /// already been elected.
    MeshJoined { hub_id: Option<DeviceId> },

    /// Periodic liveness signal carrying a freshly recomputed score.
    MeshHeartbeat { device_id: DeviceId, score: u32 },

    /// Mesh acknowledged a heartbeat.
    MeshHeartbeatAck,

    /// Full replacement of the peer table. Never a delta.
    PeerListUpdate { peers: Vec<PeerInfo> },

    /// The mesh elected a hub from the aggregated scores.
    HubElected { device_id: DeviceId },

    /// Deliver a copy of a queued command to `target` for safekeeping.
    ReplicateCommand {
        target: DeviceId,
        origin: DeviceId,
        command: NewCommand,
    },

    /// `device_id` durably stored the replicated command.
    ReplicationAck {
        request_id: RequestId,
        device_id: DeviceId,
    },

    /// The hub synced a replicated command to the cloud; holders may
    /// drop their copies.
    SyncAck { request_id: RequestId },
}
