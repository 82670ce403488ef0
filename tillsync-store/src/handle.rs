//! Async façade over the durable store.
//!
//! The rest of the engine holds a `StoreHandle`, never a `CommandStore`
//! directly. The handle is safe to call before the backing database has
//! finished opening: reads return empty/`None`, writes are buffered and
//! flushed once the store attaches. If opening fails the handle degrades
//! to no-op reads and writes — offline capability is silently lost, but
//! the host application keeps running.
//!
//! All SQLite work runs on the blocking pool.

use crate::error::StoreResult;
use crate::store::{CommandStore, StoreStats};
use std::sync::Arc;
use std::time::Duration;
use tillsync_types::{
    AuthCacheEntry, CacheEntry, CommandId, CommandStatus, DeviceId, NewCommand, QueuedCommand,
    RequestId, SyncLogEntry,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

enum HandleState {
    /// The backing store has not finished opening yet.
    Starting { buffered: Vec<BufferedWrite> },
    Ready(Arc<CommandStore>),
    /// Opening failed; every operation is a no-op.
    Unavailable,
}

enum BufferedWrite {
    Command(NewCommand),
    SyncLog {
        command_id: CommandId,
        status: CommandStatus,
        details: String,
        device_id: DeviceId,
    },
    CachePut {
        entity_type: String,
        key: String,
        data: serde_json::Value,
        ttl_minutes: i64,
    },
    AuthPut {
        user_id: String,
        token: String,
        user: serde_json::Value,
        ttl_minutes: i64,
    },
    Meta {
        key: String,
        value: String,
    },
}

/// Cloneable async handle to the durable store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<HandleState>>,
}

impl StoreHandle {
    /// Creates a handle with no backing store yet. Writes buffer until
    /// [`StoreHandle::attach`] runs.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HandleState::Starting {
                buffered: Vec::new(),
            })),
        }
    }

    /// Opens a store at `path` and attaches it. On failure the handle
    /// degrades to no-ops instead of propagating the error.
    pub async fn open(path: String) -> Self {
        let handle = Self::new();
        let opened = tokio::task::spawn_blocking(move || CommandStore::open(&path)).await;
        match opened {
            Ok(Ok(store)) => handle.attach(store).await,
            Ok(Err(e)) => {
                warn!("failed to open command store, offline queue disabled: {e}");
                handle.mark_unavailable().await;
            }
            Err(e) => {
                warn!("store open task panicked, offline queue disabled: {e}");
                handle.mark_unavailable().await;
            }
        }
        handle
    }

    /// Opens an in-memory store and attaches it (for testing).
    pub async fn in_memory() -> Self {
        let handle = Self::new();
        match CommandStore::open_in_memory() {
            Ok(store) => handle.attach(store).await,
            Err(e) => {
                warn!("failed to open in-memory store: {e}");
                handle.mark_unavailable().await;
            }
        }
        handle
    }

    /// Attaches an opened store and flushes any buffered writes, in
    /// the order they were issued.
    pub async fn attach(&self, store: CommandStore) {
        let store = Arc::new(store);
        let buffered = {
            let mut state = self.inner.write().await;
            let buffered = match &mut *state {
                HandleState::Starting { buffered } => std::mem::take(buffered),
                _ => Vec::new(),
            };
            *state = HandleState::Ready(store.clone());
            buffered
        };

        if buffered.is_empty() {
            return;
        }
        debug!("flushing {} buffered store writes", buffered.len());
        let result = tokio::task::spawn_blocking(move || {
            for write in buffered {
                let outcome: StoreResult<()> = match write {
                    BufferedWrite::Command(cmd) => store.add_command(cmd).map(|_| ()),
                    BufferedWrite::SyncLog {
                        command_id,
                        status,
                        details,
                        device_id,
                    } => store.log_sync(command_id, status, &details, device_id),
                    BufferedWrite::CachePut {
                        entity_type,
                        key,
                        data,
                        ttl_minutes,
                    } => store.cache_put(&entity_type, &key, &data, ttl_minutes),
                    BufferedWrite::AuthPut {
                        user_id,
                        token,
                        user,
                        ttl_minutes,
                    } => store.auth_put(&user_id, &token, &user, ttl_minutes),
                    BufferedWrite::Meta { key, value } => store.set_meta(&key, &value),
                };
                if let Err(e) = outcome {
                    warn!("buffered store write failed: {e}");
                }
            }
        })
        .await;
        if let Err(e) = result {
            warn!("buffered flush task panicked: {e}");
        }
    }

    /// Marks the store as permanently unavailable, dropping any
    /// buffered writes.
    pub async fn mark_unavailable(&self) {
        let mut state = self.inner.write().await;
        *state = HandleState::Unavailable;
    }

    /// Whether the backing store is attached and usable.
    pub async fn is_ready(&self) -> bool {
        matches!(&*self.inner.read().await, HandleState::Ready(_))
    }

    async fn store(&self) -> Option<Arc<CommandStore>> {
        match &*self.inner.read().await {
            HandleState::Ready(store) => Some(store.clone()),
            _ => None,
        }
    }

    /// Runs a blocking store operation, logging and swallowing errors.
    async fn run<T, F>(&self, default: T, op: &'static str, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&CommandStore) -> StoreResult<T> + Send + 'static,
    {
        let Some(store) = self.store().await else {
            return default;
        };
        match tokio::task::spawn_blocking(move || f(&store)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                warn!("store {op} failed: {e}");
                default
            }
            Err(e) => {
                warn!("store {op} task panicked: {e}");
                default
            }
        }
    }

    async fn buffer(&self, write: BufferedWrite) -> bool {
        let mut state = self.inner.write().await;
        match &mut *state {
            HandleState::Starting { buffered } => {
                buffered.push(write);
                true
            }
            _ => false,
        }
    }

    // ── Command queue ────────────────────────────────────────────

    /// Enqueues a command. Returns the stored row, or `None` when the
    /// write was buffered (store still opening) or dropped (store
    /// unavailable or errored).
    pub async fn add_command(&self, cmd: NewCommand) -> Option<QueuedCommand> {
        if self.buffer(BufferedWrite::Command(cmd.clone())).await {
            return None;
        }
        self.run(None, "add_command", move |s| s.add_command(cmd).map(Some))
            .await
    }

    /// All Pending commands in FIFO order. Empty before the store is
    /// ready.
    pub async fn pending_commands(&self) -> Vec<QueuedCommand> {
        self.run(Vec::new(), "pending_commands", |s| s.pending_commands())
            .await
    }

    /// Fetches a command by idempotency key.
    pub async fn command_by_request_id(&self, rid: RequestId) -> Option<QueuedCommand> {
        self.run(None, "command_by_request_id", move |s| {
            s.command_by_request_id(rid)
        })
        .await
    }

    /// Moves a command to a new status.
    pub async fn update_command_status(
        &self,
        id: CommandId,
        status: CommandStatus,
        result: Option<serde_json::Value>,
    ) {
        self.run((), "update_command_status", move |s| {
            s.update_command_status(id, status, result.as_ref())
        })
        .await;
    }

    /// Increments a command's retry count, returning the new value.
    pub async fn increment_retry(&self, id: CommandId) -> Option<u32> {
        self.run(None, "increment_retry", move |s| {
            s.increment_retry(id).map(Some)
        })
        .await
    }

    /// Deletes a command and its audit rows.
    pub async fn delete_command(&self, id: CommandId) {
        self.run((), "delete_command", move |s| s.delete_command(id))
            .await;
    }

    /// Prunes completed commands older than `max_age`.
    pub async fn prune_completed(&self, max_age: Duration) -> usize {
        self.run(0, "prune_completed", move |s| s.prune_completed(max_age))
            .await
    }

    // ── Cache / auth ─────────────────────────────────────────────

    /// Writes a cache entry.
    pub async fn cache_put(
        &self,
        entity_type: &str,
        key: &str,
        data: serde_json::Value,
        ttl_minutes: i64,
    ) {
        let entity_type = entity_type.to_string();
        let key = key.to_string();
        let buffered = BufferedWrite::CachePut {
            entity_type: entity_type.clone(),
            key: key.clone(),
            data: data.clone(),
            ttl_minutes,
        };
        if self.buffer(buffered).await {
            return;
        }
        self.run((), "cache_put", move |s| {
            s.cache_put(&entity_type, &key, &data, ttl_minutes)
        })
        .await;
    }

    /// Reads a cache entry, `None` when absent, expired, or not ready.
    pub async fn cache_get(&self, entity_type: &str, key: &str) -> Option<CacheEntry> {
        let entity_type = entity_type.to_string();
        let key = key.to_string();
        self.run(None, "cache_get", move |s| s.cache_get(&entity_type, &key))
            .await
    }

    /// Stores an offline credential snapshot.
    pub async fn auth_put(
        &self,
        user_id: &str,
        token: &str,
        user: serde_json::Value,
        ttl_minutes: i64,
    ) {
        let user_id_s = user_id.to_string();
        let token_s = token.to_string();
        let clone = BufferedWrite::AuthPut {
            user_id: user_id_s.clone(),
            token: token_s.clone(),
            user: user.clone(),
            ttl_minutes,
        };
        if self.buffer(clone).await {
            return;
        }
        self.run((), "auth_put", move |s| {
            s.auth_put(&user_id_s, &token_s, &user, ttl_minutes)
        })
        .await;
    }

    /// Reads a credential snapshot, `None` when absent or expired.
    pub async fn auth_get(&self, user_id: &str) -> Option<AuthCacheEntry> {
        let user_id = user_id.to_string();
        self.run(None, "auth_get", move |s| s.auth_get(&user_id))
            .await
    }

    // ── Audit log / remap / meta ─────────────────────────────────

    /// Appends one audit row for a replay attempt outcome.
    pub async fn log_sync(
        &self,
        command_id: CommandId,
        status: CommandStatus,
        details: &str,
        device_id: DeviceId,
    ) {
        let details_s = details.to_string();
        let clone = BufferedWrite::SyncLog {
            command_id,
            status,
            details: details_s.clone(),
            device_id,
        };
        if self.buffer(clone).await {
            return;
        }
        self.run((), "log_sync", move |s| {
            s.log_sync(command_id, status, &details_s, device_id)
        })
        .await;
    }

    /// All audit rows for a command.
    pub async fn sync_log_for(&self, command_id: CommandId) -> Vec<SyncLogEntry> {
        self.run(Vec::new(), "sync_log_for", move |s| s.sync_log_for(command_id))
            .await
    }

    /// Records a server-assigned ID for a synced create.
    pub async fn record_remap(&self, request_id: RequestId, server_id: &str) {
        let server_id = server_id.to_string();
        self.run((), "record_remap", move |s| {
            s.record_remap(request_id, &server_id)
        })
        .await;
    }

    /// Resolves a possibly-placeholder entity ID. Non-placeholder
    /// strings resolve to themselves even before the store is ready;
    /// an unmapped placeholder resolves to `None`.
    pub async fn resolve_placeholder(&self, id: &str) -> Option<String> {
        if tillsync_types::parse_placeholder(id).is_none() {
            return Some(id.to_string());
        }
        let id = id.to_string();
        self.run(None, "resolve_placeholder", move |s| {
            s.resolve_placeholder(&id)
        })
        .await
    }

    /// Persists a named flag.
    pub async fn set_meta(&self, key: &str, value: &str) {
        let key_s = key.to_string();
        let value_s = value.to_string();
        let clone = BufferedWrite::Meta {
            key: key_s.clone(),
            value: value_s.clone(),
        };
        if self.buffer(clone).await {
            return;
        }
        self.run((), "set_meta", move |s| s.set_meta(&key_s, &value_s))
            .await;
    }

    /// Reads a named flag.
    pub async fn get_meta(&self, key: &str) -> Option<String> {
        let key = key.to_string();
        self.run(None, "get_meta", move |s| s.get_meta(&key)).await
    }

    // ── Stats ────────────────────────────────────────────────────

    /// Aggregate queue statistics. Zeroed before the store is ready.
    pub async fn stats(&self) -> StoreStats {
        self.run(StoreStats::default(), "stats", |s| s.stats()).await
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::new()
    }
}
