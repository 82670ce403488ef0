//! SQLite-backed durable store.
//!
//! One database file holds the command queue, the read-through cache,
//! the offline auth cache, the append-only sync audit log, and the
//! offline-ID remap table. Queued commands must survive process
//! restart; everything ephemeral (peer tables, sockets) lives elsewhere.

use crate::error::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tillsync_types::{
    now_ms, AuthCacheEntry, CacheEntry, CommandId, CommandStatus, DeviceId, NewCommand,
    QueuedCommand, RequestId, SyncLogEntry,
};
use tracing::warn;

/// Default retention horizon for completed commands.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Aggregate queue statistics, the only per-store state surfaced to
/// observability views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub pending_commands: u64,
    pub failed_commands: u64,
    pub total_syncs: u64,
    /// Timestamp of the most recent sync-log row, if any.
    pub last_sync: Option<i64>,
}

/// Durable store backed by SQLite.
pub struct CommandStore {
    conn: Arc<Mutex<Connection>>,
}

impl CommandStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        store.recover_inflight()?;
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        store.recover_inflight()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS command_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                action TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                device_id TEXT NOT NULL,
                replicated INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                synced_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_command_queue_status
                ON command_queue (status, timestamp);

            CREATE TABLE IF NOT EXISTS cache_entries (
                entity_type TEXT NOT NULL,
                key TEXT NOT NULL,
                data TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                UNIQUE(entity_type, key)
            );

            CREATE TABLE IF NOT EXISTS auth_cache (
                user_id TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                user TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                offline_mode INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command_id INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL,
                details TEXT NOT NULL,
                device_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS id_remap (
                request_id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Returns Processing rows to Pending. A Processing command at open
    /// time means the process died mid-replay; the idempotency key makes
    /// re-attempting it safe.
    fn recover_inflight(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let recovered = conn.execute(
            "UPDATE command_queue SET status = 'PENDING' WHERE status = 'PROCESSING'",
            [],
        )?;
        if recovered > 0 {
            warn!(recovered, "requeued commands left in flight by a previous run");
        }
        Ok(())
    }

    // ── Command queue ────────────────────────────────────────────

    /// Enqueues a command: status Pending, retry_count 0, timestamp now.
    ///
    /// `request_id` is unique for the lifetime of the record; enqueueing
    /// the same request twice returns the existing row unchanged.
    pub fn add_command(&self, cmd: NewCommand) -> StoreResult<QueuedCommand> {
        let action_json = serde_json::to_string(&cmd.action)?;
        let ts = now_ms();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO command_queue
                 (request_id, entity_type, action, timestamp, status, retry_count, device_id, replicated)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7)",
                params![
                    cmd.request_id.to_string(),
                    cmd.action.entity_type(),
                    action_json,
                    ts,
                    CommandStatus::Pending.as_str(),
                    cmd.device_id.to_string(),
                    cmd.replicated as i64,
                ],
            )?;
        }
        self.command_by_request_id(cmd.request_id)?
            .ok_or_else(|| StoreError::Corrupt(format!("inserted command {} vanished", cmd.request_id)))
    }

    /// Fetches a command by row ID.
    pub fn command(&self, id: CommandId) -> StoreResult<Option<QueuedCommand>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, request_id, action, timestamp, status, retry_count, device_id,
                    replicated, result, synced_at
             FROM command_queue WHERE id = ?1",
            params![id.as_raw()],
            row_to_command,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Fetches a command by its idempotency key.
    pub fn command_by_request_id(&self, rid: RequestId) -> StoreResult<Option<QueuedCommand>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, request_id, action, timestamp, status, retry_count, device_id,
                    replicated, result, synced_at
             FROM command_queue WHERE request_id = ?1",
            params![rid.to_string()],
            row_to_command,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// All Pending commands in FIFO replay order: ascending timestamp,
    /// ties broken by insertion order.
    pub fn pending_commands(&self) -> StoreResult<Vec<QueuedCommand>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, request_id, action, timestamp, status, retry_count, device_id,
                    replicated, result, synced_at
             FROM command_queue WHERE status = 'PENDING'
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_command)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Moves a command to a new status, enforcing the legal transition
    /// relation. Stamps `synced_at` and stores the server result when
    /// the new status is Synced.
    pub fn update_command_status(
        &self,
        id: CommandId,
        status: CommandStatus,
        result: Option<&serde_json::Value>,
    ) -> StoreResult<()> {
        let current = self
            .command(id)?
            .ok_or(StoreError::NotFound(id.as_raw()))?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let result_json = result.map(serde_json::to_string).transpose()?;
        let synced_at = (status == CommandStatus::Synced).then(now_ms);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE command_queue
             SET status = ?1,
                 result = COALESCE(?2, result),
                 synced_at = COALESCE(?3, synced_at)
             WHERE id = ?4",
            params![status.as_str(), result_json, synced_at, id.as_raw()],
        )?;
        Ok(())
    }

    /// Increments a command's retry count and returns the new value.
    /// The count never decreases.
    pub fn increment_retry(&self, id: CommandId) -> StoreResult<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE command_queue SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id.as_raw()],
        )?;
        let count: u32 = conn
            .query_row(
                "SELECT retry_count FROM command_queue WHERE id = ?1",
                params![id.as_raw()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound(id.as_raw()))?;
        Ok(count)
    }

    /// Deletes a command and its audit rows.
    pub fn delete_command(&self, id: CommandId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM command_queue WHERE id = ?1", params![id.as_raw()])?;
        conn.execute("DELETE FROM sync_log WHERE command_id = ?1", params![id.as_raw()])?;
        Ok(())
    }

    /// Deletes Synced/Failed commands older than `max_age`, together
    /// with their sync-log rows. Pending and Processing commands are
    /// never pruned. Returns the number of commands removed.
    pub fn prune_completed(&self, max_age: Duration) -> StoreResult<usize> {
        let horizon = now_ms() - max_age.as_millis() as i64;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_log WHERE command_id IN (
                 SELECT id FROM command_queue
                 WHERE status IN ('SYNCED', 'FAILED') AND timestamp < ?1
             )",
            params![horizon],
        )?;
        let removed = conn.execute(
            "DELETE FROM command_queue
             WHERE status IN ('SYNCED', 'FAILED') AND timestamp < ?1",
            params![horizon],
        )?;
        Ok(removed)
    }

    // ── Read-through cache ───────────────────────────────────────

    /// Writes (or refreshes) a cache entry with the given TTL.
    /// A TTL of zero minutes produces an entry that is already expired.
    pub fn cache_put(
        &self,
        entity_type: &str,
        key: &str,
        data: &serde_json::Value,
        ttl_minutes: i64,
    ) -> StoreResult<()> {
        let now = now_ms();
        let expires_at = now + ttl_minutes * 60 * 1000;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cache_entries (entity_type, key, data, cached_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_type, key) DO UPDATE SET
                 data = excluded.data,
                 cached_at = excluded.cached_at,
                 expires_at = excluded.expires_at",
            params![entity_type, key, serde_json::to_string(data)?, now, expires_at],
        )?;
        Ok(())
    }

    /// Reads a cache entry. A read at or past `expires_at` purges the
    /// row and returns `None`.
    pub fn cache_get(&self, entity_type: &str, key: &str) -> StoreResult<Option<CacheEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                "SELECT entity_type, key, data, cached_at, expires_at
                 FROM cache_entries WHERE entity_type = ?1 AND key = ?2",
                params![entity_type, key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((etype, k, data, cached_at, expires_at)) = entry else {
            return Ok(None);
        };

        if now_ms() >= expires_at {
            conn.execute(
                "DELETE FROM cache_entries WHERE entity_type = ?1 AND key = ?2",
                params![entity_type, key],
            )?;
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            entity_type: etype,
            key: k,
            data: serde_json::from_str(&data)?,
            cached_at,
            expires_at,
        }))
    }

    // ── Auth cache ───────────────────────────────────────────────

    /// Stores an offline credential snapshot for a user.
    pub fn auth_put(
        &self,
        user_id: &str,
        token: &str,
        user: &serde_json::Value,
        ttl_minutes: i64,
    ) -> StoreResult<()> {
        let expires_at = now_ms() + ttl_minutes * 60 * 1000;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO auth_cache (user_id, token, user, expires_at, offline_mode)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(user_id) DO UPDATE SET
                 token = excluded.token,
                 user = excluded.user,
                 expires_at = excluded.expires_at",
            params![user_id, token, serde_json::to_string(user)?, expires_at],
        )?;
        Ok(())
    }

    /// Reads a credential snapshot, purging it if expired.
    pub fn auth_get(&self, user_id: &str) -> StoreResult<Option<AuthCacheEntry>> {
        let conn = self.conn.lock().unwrap();
        let entry = conn
            .query_row(
                "SELECT user_id, token, user, expires_at, offline_mode
                 FROM auth_cache WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((uid, token, user, expires_at, offline_mode)) = entry else {
            return Ok(None);
        };

        if now_ms() >= expires_at {
            conn.execute("DELETE FROM auth_cache WHERE user_id = ?1", params![user_id])?;
            return Ok(None);
        }

        Ok(Some(AuthCacheEntry {
            user_id: uid,
            token,
            user: serde_json::from_str(&user)?,
            expires_at,
            offline_mode: offline_mode != 0,
        }))
    }

    // ── Sync audit log ───────────────────────────────────────────

    /// Appends one audit row for a replay attempt outcome.
    pub fn log_sync(
        &self,
        command_id: CommandId,
        status: CommandStatus,
        details: &str,
        device_id: DeviceId,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_log (command_id, timestamp, status, details, device_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                command_id.as_raw(),
                now_ms(),
                status.as_str(),
                details,
                device_id.to_string(),
            ],
        )?;
        Ok(())
    }

    /// All audit rows for a command, oldest first.
    pub fn sync_log_for(&self, command_id: CommandId) -> StoreResult<Vec<SyncLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT command_id, timestamp, status, details, device_id
             FROM sync_log WHERE command_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![command_id.as_raw()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (cid, ts, status, details, device) = row?;
            out.push(SyncLogEntry {
                command_id: CommandId::from_raw(cid),
                timestamp: ts,
                status: CommandStatus::parse(&status)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad sync_log status {status}")))?,
                details,
                device_id: DeviceId::parse(&device)
                    .map_err(|e| StoreError::Corrupt(format!("bad sync_log device_id: {e}")))?,
            });
        }
        Ok(out)
    }

    // ── Offline-ID remap ─────────────────────────────────────────

    /// Records the server-assigned ID for a create that replayed
    /// successfully, keyed by its idempotency key.
    pub fn record_remap(&self, request_id: RequestId, server_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO id_remap (request_id, server_id) VALUES (?1, ?2)
             ON CONFLICT(request_id) DO UPDATE SET server_id = excluded.server_id",
            params![request_id.to_string(), server_id],
        )?;
        Ok(())
    }

    /// Resolves a placeholder (`offline_<request_id>`) to its
    /// server-assigned ID, if the create has synced. Non-placeholder
    /// strings resolve to themselves.
    pub fn resolve_placeholder(&self, id: &str) -> StoreResult<Option<String>> {
        let Some(rid) = tillsync_types::parse_placeholder(id) else {
            return Ok(Some(id.to_string()));
        };
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT server_id FROM id_remap WHERE request_id = ?1",
            params![rid.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    // ── Meta flags ───────────────────────────────────────────────

    /// Persists a small named flag (e.g. the elected-hub flag).
    pub fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Reads a named flag.
    pub fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(StoreError::from)
    }

    // ── Stats ────────────────────────────────────────────────────

    /// Aggregate queue statistics.
    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let pending: u64 = conn.query_row(
            "SELECT COUNT(*) FROM command_queue WHERE status = 'PENDING'",
            [],
            |row| row.get(0),
        )?;
        let failed: u64 = conn.query_row(
            "SELECT COUNT(*) FROM command_queue WHERE status = 'FAILED'",
            [],
            |row| row.get(0),
        )?;
        let total_syncs: u64 =
            conn.query_row("SELECT COUNT(*) FROM sync_log", [], |row| row.get(0))?;
        let last_sync: Option<i64> =
            conn.query_row("SELECT MAX(timestamp) FROM sync_log", [], |row| row.get(0))?;
        Ok(StoreStats {
            pending_commands: pending,
            failed_commands: failed,
            total_syncs,
            last_sync,
        })
    }
}

fn row_to_command(row: &Row<'_>) -> rusqlite::Result<QueuedCommand> {
    let id: i64 = row.get(0)?;
    let request_id: String = row.get(1)?;
    let action: String = row.get(2)?;
    let timestamp: i64 = row.get(3)?;
    let status: String = row.get(4)?;
    let retry_count: u32 = row.get(5)?;
    let device_id: String = row.get(6)?;
    let replicated: i64 = row.get(7)?;
    let result: Option<String> = row.get(8)?;
    let synced_at: Option<i64> = row.get(9)?;

    // Map parse failures through FromSql's error path so query_row keeps
    // a single error type.
    let invalid = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    Ok(QueuedCommand {
        id: CommandId::from_raw(id),
        request_id: RequestId::parse(&request_id).map_err(|e| invalid(1, Box::new(e)))?,
        action: serde_json::from_str(&action).map_err(|e| invalid(2, Box::new(e)))?,
        timestamp,
        status: CommandStatus::parse(&status)
            .ok_or_else(|| invalid(4, format!("bad status {status}").into()))?,
        retry_count,
        device_id: DeviceId::parse(&device_id).map_err(|e| invalid(6, Box::new(e)))?,
        replicated: replicated != 0,
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| invalid(8, Box::new(e)))?,
        synced_at,
    })
}
