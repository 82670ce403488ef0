//! Core type definitions for tillsync.
//!
//! Everything shared between the store, the replay engine, the network
//! clients, and the orchestrator lives here: identifier newtypes, the
//! command queue data model, cache/auth/audit records, and the derived
//! resilience status.

mod command;
mod ids;
mod records;
mod resilience;

pub use command::{CommandAction, CommandStatus, NewCommand, QueuedCommand};
pub use ids::{parse_placeholder, CommandId, DeviceId, RequestId};
pub use records::{AuthCacheEntry, CacheEntry, SyncLogEntry, AUTH_TTL_MINUTES};
pub use resilience::{DeviceType, PeerInfo, ResilienceMode, ResilienceStatus};

/// Milliseconds since the Unix epoch, now.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
