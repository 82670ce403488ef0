//! Replay engine: drains the durable command queue against the cloud.
//!
//! While the online signal is up, a recurring cycle replays pending
//! commands in FIFO order, one at a time, each attempt tagged with the
//! command's idempotency key. A cycle holds a single-flight permit so
//! a manual "sync now" can never interleave with a scheduled cycle.

use crate::client::CloudClient;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tillsync_store::StoreHandle;
use tillsync_types::{CommandAction, CommandStatus, QueuedCommand};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the replay engine.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Period of the recurring replay cycle.
    pub cycle_interval: Duration,
    /// Cumulative retryable failures before a command becomes Failed.
    pub max_retries: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Outcome of one replay cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Commands attempted this cycle.
    pub attempted: usize,
    /// Commands that reached Synced.
    pub synced: usize,
    /// Commands that reached Failed (terminal).
    pub failed: usize,
    /// Commands left Pending: retryable failure or unresolved
    /// placeholder dependency.
    pub deferred: usize,
    /// True when the cycle was skipped because another was in flight.
    pub skipped: bool,
}

struct Shared {
    store: StoreHandle,
    client: Arc<CloudClient>,
    config: ReplayConfig,
    /// Single-flight permit for the replay cycle.
    inflight: Semaphore,
    online_tx: watch::Sender<bool>,
}

/// Drains the command queue against the cloud API.
pub struct ReplayEngine {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayEngine {
    /// Creates a new replay engine. It starts offline and idle; call
    /// [`ReplayEngine::start`] and [`ReplayEngine::set_online`].
    #[must_use]
    pub fn new(store: StoreHandle, client: Arc<CloudClient>, config: ReplayConfig) -> Self {
        let (online_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                store,
                client,
                config,
                inflight: Semaphore::new(1),
                online_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawns the recurring replay cycle. Idempotent: a second call
    /// while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            let mut online_rx = shared.online_tx.subscribe();
            let mut ticker = tokio::time::interval(shared.config.cycle_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *online_rx.borrow() {
                            run_cycle(&shared).await;
                        }
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online_rx.borrow() {
                            info!("online signal up, forcing replay cycle");
                            run_cycle(&shared).await;
                        }
                    }
                }
            }
        }));
    }

    /// Stops the recurring cycle. The engine's own timer is cleared;
    /// nothing else is torn down.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Whether the recurring cycle is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    /// Updates the online signal. A transition to online forces an
    /// immediate cycle (from the spawned task).
    pub fn set_online(&self, online: bool) {
        self.shared.online_tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Whether the engine currently believes it is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.shared.online_tx.borrow()
    }

    /// Runs one replay cycle now, regardless of the online signal.
    /// Skipped (not queued) if a cycle is already in flight.
    pub async fn sync_now(&self) -> CycleReport {
        run_cycle(&self.shared).await
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn run_cycle(shared: &Shared) -> CycleReport {
    let Ok(_permit) = shared.inflight.try_acquire() else {
        debug!("replay cycle already in flight, skipping");
        return CycleReport {
            skipped: true,
            ..CycleReport::default()
        };
    };

    let pending = shared.store.pending_commands().await;
    if pending.is_empty() {
        return CycleReport::default();
    }

    info!("replaying {} pending commands", pending.len());
    let mut report = CycleReport::default();
    for command in pending {
        report.attempted += 1;
        match attempt(shared, command).await {
            AttemptOutcome::Synced => report.synced += 1,
            AttemptOutcome::Failed => report.failed += 1,
            AttemptOutcome::Deferred => report.deferred += 1,
        }
    }
    info!(
        "replay cycle done: {} synced, {} failed, {} deferred",
        report.synced, report.failed, report.deferred
    );
    report
}

enum AttemptOutcome {
    Synced,
    Failed,
    Deferred,
}

async fn attempt(shared: &Shared, command: QueuedCommand) -> AttemptOutcome {
    let device_id = command.device_id;

    // Rewrite placeholder references through the remap table before
    // dispatch. A dependent whose create has not synced yet stays
    // Pending for a later cycle without consuming retry budget.
    let action = match resolve_action(shared, &command.action).await {
        Some(action) => action,
        None => {
            debug!(
                "command {} depends on an unsynced create, deferring",
                command.id
            );
            return AttemptOutcome::Deferred;
        }
    };

    shared
        .store
        .update_command_status(command.id, CommandStatus::Processing, None)
        .await;

    match shared.client.replay(&action, command.request_id).await {
        Ok(result) => {
            if action.is_create() {
                if let Some(server_id) = result.get("id").and_then(|v| v.as_str()) {
                    shared.store.record_remap(command.request_id, server_id).await;
                }
            }
            shared
                .store
                .update_command_status(command.id, CommandStatus::Synced, Some(result))
                .await;
            shared
                .store
                .log_sync(command.id, CommandStatus::Synced, "replayed", device_id)
                .await;
            AttemptOutcome::Synced
        }
        Err(e) if !e.is_retryable() => {
            warn!("command {} rejected, marking failed: {e}", command.id);
            shared
                .store
                .update_command_status(command.id, CommandStatus::Failed, None)
                .await;
            shared
                .store
                .log_sync(command.id, CommandStatus::Failed, &e.to_string(), device_id)
                .await;
            AttemptOutcome::Failed
        }
        Err(e) => {
            let retries = shared
                .store
                .increment_retry(command.id)
                .await
                .unwrap_or(command.retry_count + 1);
            if retries >= shared.config.max_retries {
                warn!(
                    "command {} exhausted its {} retries: {e}",
                    command.id, shared.config.max_retries
                );
                shared
                    .store
                    .update_command_status(command.id, CommandStatus::Failed, None)
                    .await;
                shared
                    .store
                    .log_sync(command.id, CommandStatus::Failed, &e.to_string(), device_id)
                    .await;
                AttemptOutcome::Failed
            } else {
                debug!(
                    "command {} attempt {retries} failed, will retry: {e}",
                    command.id
                );
                shared
                    .store
                    .update_command_status(command.id, CommandStatus::Pending, None)
                    .await;
                shared
                    .store
                    .log_sync(command.id, CommandStatus::Pending, &e.to_string(), device_id)
                    .await;
                AttemptOutcome::Deferred
            }
        }
    }
}

/// Resolves placeholder entity IDs inside an action. Returns `None`
/// when a referenced create has not synced yet.
async fn resolve_action(shared: &Shared, action: &CommandAction) -> Option<CommandAction> {
    match action {
        CommandAction::AddOrderItem { order_id, payload } => {
            let order_id = shared.store.resolve_placeholder(order_id).await?;
            Some(CommandAction::AddOrderItem {
                order_id,
                payload: payload.clone(),
            })
        }
        CommandAction::RecordPayment { order_id, payload } => {
            let order_id = shared.store.resolve_placeholder(order_id).await?;
            Some(CommandAction::RecordPayment {
                order_id,
                payload: payload.clone(),
            })
        }
        other => Some(other.clone()),
    }
}
