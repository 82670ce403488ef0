//! Persisted records other than the command queue: the read-through
//! cache, the offline auth cache, and the append-only sync audit log.

use crate::command::CommandStatus;
use crate::ids::{CommandId, DeviceId};
use serde::{Deserialize, Serialize};

/// Default lifetime of an offline credential snapshot.
pub const AUTH_TTL_MINUTES: i64 = 8 * 60;

/// A read-through cache row, keyed by `entity_type:key`.
///
/// A read at or past `expires_at` must treat the entry as absent and
/// purge it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_type: String,
    pub key: String,
    pub data: serde_json::Value,
    /// When the entry was written, milliseconds since Unix epoch.
    pub cached_at: i64,
    /// When the entry stops being valid, milliseconds since Unix epoch.
    pub expires_at: i64,
}

impl CacheEntry {
    /// Whether the entry is expired at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Credential snapshot allowing authenticated operation while the
/// cloud is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCacheEntry {
    pub user_id: String,
    pub token: String,
    /// Serialized user record, opaque to the engine.
    pub user: serde_json::Value,
    pub expires_at: i64,
    /// True when the snapshot was taken for offline use.
    pub offline_mode: bool,
}

impl AuthCacheEntry {
    /// Whether the snapshot is expired at `now_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// One append-only audit row per replay attempt outcome.
/// Never updated or deleted (except by retention pruning of the
/// command it belongs to).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub command_id: CommandId,
    pub timestamp: i64,
    pub status: CommandStatus,
    pub details: String,
    pub device_id: DeviceId,
}
