//! Operating tiers, mesh membership, and the derived status snapshot.

use crate::ids::DeviceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware class of a mesh peer. Feeds the hub-election score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Kiosk,
    Tablet,
    Phone,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Kiosk => "kiosk",
            DeviceType::Tablet => "tablet",
            DeviceType::Phone => "phone",
        };
        f.write_str(s)
    }
}

/// Ephemeral mesh-membership record. Held only in memory and replaced
/// wholesale on each peer-list update; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: DeviceType,
    pub score: u32,
}

/// The orchestrator's current operating tier.
///
/// Precedence is strict: cloud beats edge beats mesh beats device,
/// regardless of how healthy the lower tier looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResilienceMode {
    /// Initial state, before the first reachability evaluation.
    Unknown,
    /// Cloud reachable; mutations go straight to the cloud.
    Online,
    /// Cloud down, venue edge gateway reachable; mutations are
    /// forwarded to the gateway's durable queue.
    Edge,
    /// Cloud and edge down, but peers are reachable; mutations queue
    /// locally and replicate across the mesh.
    Mesh,
    /// Fully offline; mutations queue locally only.
    Device,
}

impl fmt::Display for ResilienceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResilienceMode::Unknown => "unknown",
            ResilienceMode::Online => "online",
            ResilienceMode::Edge => "edge",
            ResilienceMode::Mesh => "mesh",
            ResilienceMode::Device => "device",
        };
        f.write_str(s)
    }
}

/// Derived snapshot published by the orchestrator after every
/// reachability evaluation. Owned exclusively by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceStatus {
    pub mode: ResilienceMode,
    pub cloud_reachable: bool,
    pub edge_reachable: bool,
    pub mesh_active: bool,
    pub is_hub: bool,
    pub peer_count: usize,
    pub pending_commands: u64,
}

impl Default for ResilienceStatus {
    fn default() -> Self {
        Self {
            mode: ResilienceMode::Unknown,
            cloud_reachable: false,
            edge_reachable: false,
            mesh_active: false,
            is_hub: false,
            peer_count: 0,
            pending_commands: 0,
        }
    }
}
