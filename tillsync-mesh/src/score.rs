//! Hub-election scoring.
//!
//! Every device computes its own score and carries it on joins and
//! heartbeats; the mesh backend aggregates the scores and announces the
//! elected hub. Stationary, powered hardware should win: a desktop till
//! beats a charging tablet beats a phone in a waiter's pocket.

use std::cmp::Ordering;
use std::time::Duration;
use tillsync_types::{DeviceType, PeerInfo};

/// Cap on the uptime bonus: one point per minute, up to 50.
pub const UPTIME_BONUS_CAP: u32 = 50;

/// Cap on the network-quality bonus.
pub const NETWORK_BONUS_CAP: u32 = 30;

/// Inputs to the election score, sampled at heartbeat time.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub device_type: DeviceType,
    /// Whether the device is on external power.
    pub charging: bool,
    /// Battery level, 0–100.
    pub battery_percent: u8,
    /// How long this device has been up.
    pub uptime: Duration,
    /// Link quality estimate, 0–30. Values above the cap are clamped.
    pub network_quality: u32,
}

/// Computes the hub-election score.
///
/// Device-type weight, plus one point per uptime minute (capped at
/// [`UPTIME_BONUS_CAP`]), plus the network-quality bonus (capped at
/// [`NETWORK_BONUS_CAP`]), plus half the battery percentage. Monotonic
/// in uptime below the cap, never decreasing above it.
#[must_use]
pub fn election_score(inputs: &ScoreInputs) -> u32 {
    let type_weight = match inputs.device_type {
        DeviceType::Desktop | DeviceType::Kiosk => 100,
        DeviceType::Tablet if inputs.charging => 80,
        DeviceType::Tablet => 60,
        DeviceType::Phone => 30,
    };
    let uptime_bonus = u32::try_from(inputs.uptime.as_secs() / 60)
        .unwrap_or(UPTIME_BONUS_CAP)
        .min(UPTIME_BONUS_CAP);
    let network_bonus = inputs.network_quality.min(NETWORK_BONUS_CAP);
    let battery_bonus = u32::from(inputs.battery_percent.min(100)) / 2;

    type_weight + uptime_bonus + network_bonus + battery_bonus
}

/// Orders peers for replication and election: highest score first,
/// ties broken by lowest device ID so every device ranks the mesh
/// identically.
#[must_use]
pub fn compare_peers(a: &PeerInfo, b: &PeerInfo) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.device_id.cmp(&b.device_id))
}

/// Picks the replication targets for a locally queued command: the top
/// `replication_factor - 1` ranked peers, the originator being the
/// remaining copy.
#[must_use]
pub fn replication_targets(peers: &[PeerInfo], replication_factor: usize) -> Vec<PeerInfo> {
    let wanted = replication_factor.saturating_sub(1);
    let mut ranked = peers.to_vec();
    ranked.sort_by(compare_peers);
    ranked.truncate(wanted);
    ranked
}
