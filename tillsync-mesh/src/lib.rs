//! Device-mesh client.
//!
//! When neither the cloud nor the venue's edge gateway is reachable,
//! nearby devices form an ad-hoc mesh over WebSocket. Each device
//! carries an election score on its heartbeats; the mesh backend
//! aggregates them and elects a hub. Queued commands are replicated to
//! the highest-scored peers so a single lost device cannot lose a sale.
//!
//! Errors here never cross the component boundary: everything is
//! caught and logged, and callers observe only the [`MeshSnapshot`]
//! watch channel and the [`MeshEvent`] stream.

mod client;
mod protocol;
mod score;

pub use client::{DeviceVitals, MeshClient, MeshConfig, MeshEvent, MeshSnapshot};
pub use protocol::MeshMessage;
pub use score::{
    compare_peers, election_score, replication_targets, ScoreInputs, NETWORK_BONUS_CAP,
    UPTIME_BONUS_CAP,
};
