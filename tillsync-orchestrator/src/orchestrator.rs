//! The resilience orchestrator.
//!
//! Owns the store, replay engine, gateway client/session, and mesh
//! client as explicit objects with a `start()`/`stop()` lifecycle under
//! caller control. A 30s poll (plus one evaluation at startup) probes
//! cloud and edge reachability, folds in the mesh snapshot, derives the
//! operating mode, and fires mode-entry side effects. Command
//! submission routes through the current mode.
//!
//! Mode-exit teardown is deliberately absent: leaving a tier does not
//! close that tier's connections. A working socket is never discarded
//! speculatively; everything is torn down only by `stop()`. The
//! published mode can therefore lag the set of live connections.

use crate::mode::decide_mode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tillsync_gateway::{GatewayClient, GatewaySession};
use tillsync_mesh::MeshClient;
use tillsync_replay::{CloudClient, CycleReport, ReplayEngine};
use tillsync_store::{StoreHandle, DEFAULT_RETENTION};
use tillsync_types::{
    CommandAction, CommandStatus, NewCommand, RequestId, ResilienceMode, ResilienceStatus,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Orchestrator timing knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often reachability is re-evaluated.
    pub poll_interval: Duration,
    /// How long Synced/Failed commands are kept before pruning.
    pub retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            retention: DEFAULT_RETENTION,
        }
    }
}

/// What happened to a submitted mutation.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Executed directly against the cloud.
    Completed { result: serde_json::Value },
    /// Handed to the edge gateway's durable queue.
    Forwarded { request_id: RequestId },
    /// Queued in the local store for later replay. Creates carry the
    /// placeholder entity ID dependent mutations should reference.
    Queued {
        request_id: RequestId,
        placeholder_id: Option<String>,
    },
}

impl SubmitOutcome {
    /// Whether the mutation is waiting in a queue rather than applied.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        !matches!(self, SubmitOutcome::Completed { .. })
    }
}

struct Inner {
    config: OrchestratorConfig,
    store: StoreHandle,
    cloud: Arc<CloudClient>,
    replay: ReplayEngine,
    gateway: GatewayClient,
    session: GatewaySession,
    mesh: MeshClient,
    status_tx: watch::Sender<ResilienceStatus>,
}

/// Ties the resilience components together and decides the mode.
pub struct ResilienceOrchestrator {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceOrchestrator {
    /// Wires up the orchestrator from already-constructed components.
    /// Nothing runs until [`ResilienceOrchestrator::start`].
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        store: StoreHandle,
        cloud: Arc<CloudClient>,
        replay: ReplayEngine,
        gateway: GatewayClient,
        session: GatewaySession,
        mesh: MeshClient,
    ) -> Self {
        let (status_tx, _) = watch::channel(ResilienceStatus::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                cloud,
                replay,
                gateway,
                session,
                mesh,
                status_tx,
            }),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// The current status snapshot.
    #[must_use]
    pub fn status(&self) -> ResilienceStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Watch channel publishing a fresh status after every evaluation.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ResilienceStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Starts the replay engine and the reachability poll. The first
    /// evaluation runs immediately.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        self.inner.replay.start();

        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut poll = tokio::time::interval(inner.config.poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = poll.tick() => inner.evaluate().await,
                }
            }
        }));
    }

    /// Runs a single reachability evaluation outside the poll cadence,
    /// e.g. when the host application resumes from the background.
    pub async fn evaluate_now(&self) {
        self.inner.evaluate().await;
    }

    /// Forces a replay cycle right now.
    pub async fn sync_now(&self) -> CycleReport {
        self.inner.replay.sync_now().await
    }

    /// Routes a mutation through the current mode.
    ///
    /// Never fails: any path that cannot confirm the mutation against
    /// its tier falls through to the local queue.
    pub async fn submit(&self, action: CommandAction) -> SubmitOutcome {
        let mode = self.inner.status_tx.borrow().mode;
        let command = NewCommand::local(action, self.inner.cloud.device_id());

        match mode {
            ResilienceMode::Online => {
                match self
                    .inner
                    .cloud
                    .execute(&command.action, command.request_id)
                    .await
                {
                    Ok(result) => SubmitOutcome::Completed { result },
                    Err(e) => {
                        warn!("direct cloud call failed, queueing instead: {e}");
                        self.queue_locally(command).await
                    }
                }
            }
            ResilienceMode::Edge => match self.inner.gateway.enqueue_command(&command).await {
                Ok(()) => SubmitOutcome::Forwarded {
                    request_id: command.request_id,
                },
                Err(e) => {
                    warn!("gateway enqueue failed, queueing locally: {e}");
                    self.queue_locally(command).await
                }
            },
            ResilienceMode::Mesh => {
                let outcome = self.queue_locally(command).await;
                if let SubmitOutcome::Queued { request_id, .. } = &outcome {
                    if let Some(cmd) = self.inner.store.command_by_request_id(*request_id).await {
                        self.inner.mesh.replicate(&cmd);
                    }
                }
                outcome
            }
            ResilienceMode::Device | ResilienceMode::Unknown => self.queue_locally(command).await,
        }
    }

    async fn queue_locally(&self, command: NewCommand) -> SubmitOutcome {
        let request_id = command.request_id;
        let placeholder_id = command.action.is_create().then(|| request_id.placeholder());
        self.inner.store.add_command(command).await;
        debug!(%request_id, "mutation queued for later replay");
        SubmitOutcome::Queued {
            request_id,
            placeholder_id,
        }
    }

    /// Tears down the poll task, replay engine, gateway session, and
    /// mesh client. Each component clears only its own timers and
    /// sockets.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.inner.replay.stop();
        self.inner.session.stop();
        self.inner.mesh.stop();
        info!("orchestrator stopped");
    }
}

impl Drop for ResilienceOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Inner {
    async fn evaluate(&self) {
        let cloud_reachable = self.cloud.health_check().await;
        let edge_reachable = self.gateway.probe_health().await;
        let mesh = self.mesh.current();
        let mode = decide_mode(cloud_reachable, edge_reachable, mesh.active, mesh.peer_count);

        // The replay engine follows raw cloud reachability, not the
        // mode: a forced cycle fires inside the engine on the
        // offline-to-online flip.
        self.replay.set_online(cloud_reachable);

        let previous = self.status_tx.borrow().mode;
        if mode != previous {
            info!(%previous, current = %mode, "resilience mode changed");
            self.enter_mode(mode);
        }

        // With no direct cloud the replay engine idles, but the gateway
        // still reaches out. Hand it the queue on every Edge pass.
        if mode == ResilienceMode::Edge {
            self.forward_pending_to_gateway().await;
        }

        let stats = self.store.stats().await;
        self.session.set_pending_depth(stats.pending_commands);
        if cloud_reachable {
            self.store.prune_completed(self.config.retention).await;
        }

        // send_replace, not send: the snapshot must land even when
        // nobody holds a watch receiver.
        self.status_tx.send_replace(ResilienceStatus {
            mode,
            cloud_reachable,
            edge_reachable,
            mesh_active: mesh.active,
            is_hub: mesh.is_hub,
            peer_count: mesh.peer_count,
            pending_commands: stats.pending_commands,
        });
    }

    /// Hands locally queued commands to the gateway's durable queue,
    /// then asks the gateway to sync against the cloud. Stops at the
    /// first enqueue failure; whatever remains stays local for the
    /// next pass. The gateway de-duplicates on the idempotency key, so
    /// a crash between enqueue and the local status flip is harmless.
    async fn forward_pending_to_gateway(&self) {
        let pending = self.store.pending_commands().await;
        if pending.is_empty() {
            return;
        }
        info!(
            count = pending.len(),
            "forwarding queued commands to the edge gateway"
        );
        let mut forwarded = false;
        for cmd in pending {
            let command = NewCommand {
                request_id: cmd.request_id,
                action: cmd.action.clone(),
                device_id: cmd.device_id,
                replicated: cmd.replicated,
            };
            if let Err(e) = self.gateway.enqueue_command(&command).await {
                warn!("gateway enqueue failed mid-drain, keeping the rest local: {e}");
                break;
            }
            self.store
                .update_command_status(cmd.id, CommandStatus::Processing, None)
                .await;
            self.store
                .update_command_status(cmd.id, CommandStatus::Synced, None)
                .await;
            self.store
                .log_sync(
                    cmd.id,
                    CommandStatus::Synced,
                    "forwarded to edge gateway",
                    cmd.device_id,
                )
                .await;
            forwarded = true;
        }
        if forwarded {
            if let Err(e) = self.gateway.trigger_sync().await {
                debug!("gateway sync trigger declined: {e}");
            }
        }
    }

    /// Mode-entry side effects. Exits tear nothing down.
    fn enter_mode(&self, mode: ResilienceMode) {
        match mode {
            // set_online above already forces the catch-up cycle.
            ResilienceMode::Online => {}
            ResilienceMode::Edge => self.session.start(),
            ResilienceMode::Mesh => self.mesh.start(),
            // Replay idles offline and the queue accumulates. The mesh
            // join attempt starts here: if peers turn up, the next
            // evaluation upgrades the mode to Mesh.
            ResilienceMode::Device => self.mesh.start(),
            ResilienceMode::Unknown => {}
        }
    }
}
