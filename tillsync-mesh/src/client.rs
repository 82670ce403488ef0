//! Device-mesh WebSocket client.
//!
//! Joins the venue mesh, heartbeats with a freshly recomputed election
//! score, mirrors server-pushed mesh state (peer table, hub election),
//! and replicates locally queued commands to the highest-scored peers.
//! Reconnection backs off exponentially and is bounded: after the
//! attempt budget is spent the client emits [`MeshEvent::GaveUp`] and
//! stops, so a dead mesh is visible instead of silently absent.

use crate::protocol::MeshMessage;
use crate::score::{election_score, replication_targets, ScoreInputs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tillsync_store::StoreHandle;
use tillsync_types::{DeviceId, DeviceType, NewCommand, PeerInfo, QueuedCommand, RequestId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Meta key under which the locally elected hub flag is persisted.
const HUB_FLAG_KEY: &str = "mesh_is_hub";

/// Configuration for the mesh client.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// WebSocket endpoint of the venue mesh. `None` disables the
    /// client entirely.
    pub mesh_url: Option<String>,
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: DeviceType,
    /// Total copies a replicated command should exist on, including
    /// the originator.
    pub replication_factor: usize,
    /// Heartbeat period while connected.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles on each failure.
    pub backoff_base: Duration,
    /// Ceiling on the reconnect delay.
    pub backoff_cap: Duration,
    /// Consecutive failed connection attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl MeshConfig {
    /// A disabled config: no endpoint, `start()` is a no-op.
    #[must_use]
    pub fn disabled(device_id: DeviceId, device_type: DeviceType) -> Self {
        Self {
            mesh_url: None,
            device_id,
            device_name: "POS Device".to_string(),
            device_type,
            replication_factor: 3,
            heartbeat_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 10,
        }
    }

    /// A config pointing at a mesh endpoint.
    #[must_use]
    pub fn with_endpoint(
        mesh_url: impl Into<String>,
        device_id: DeviceId,
        device_type: DeviceType,
    ) -> Self {
        Self {
            mesh_url: Some(mesh_url.into()),
            ..Self::disabled(device_id, device_type)
        }
    }
}

/// Mutable device health sampled into each heartbeat's score.
#[derive(Debug, Clone, Copy)]
pub struct DeviceVitals {
    pub charging: bool,
    pub battery_percent: u8,
    /// Link quality estimate, 0–30.
    pub network_quality: u32,
}

impl Default for DeviceVitals {
    fn default() -> Self {
        Self {
            charging: false,
            battery_percent: 100,
            network_quality: 0,
        }
    }
}

/// Mesh state the orchestrator folds into its status snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshSnapshot {
    /// Whether a mesh session is currently joined.
    pub active: bool,
    /// Whether this device is the elected hub.
    pub is_hub: bool,
    /// Peers currently in the mesh, excluding this device.
    pub peer_count: usize,
}

/// Events surfaced from the mesh session.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// The join was acknowledged.
    Joined,
    /// The mesh elected a hub.
    HubElected { device_id: DeviceId, is_self: bool },
    /// A replicated copy from another device was stored locally.
    ReplicaStored(RequestId),
    /// A peer durably stored one of our replicated commands.
    ReplicationAcked { request_id: RequestId, device_id: DeviceId },
    /// The hub synced a replicated command; the local copy was dropped.
    SyncAcked(RequestId),
    /// The socket dropped; a reconnect is scheduled.
    Disconnected,
    /// The reconnect budget is spent. The client has stopped.
    GaveUp,
}

/// WebSocket client for the device mesh.
pub struct MeshClient {
    config: MeshConfig,
    store: StoreHandle,
    vitals: Arc<Mutex<DeviceVitals>>,
    started_at: Instant,
    peers: Arc<Mutex<Vec<PeerInfo>>>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    event_tx: broadcast::Sender<MeshEvent>,
    /// Sender into the live socket, present only while a session runs.
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<MeshMessage>>>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshClient {
    /// Creates a mesh client. Nothing connects until [`MeshClient::start`].
    #[must_use]
    pub fn new(config: MeshConfig, store: StoreHandle) -> Self {
        let (snapshot_tx, _) = watch::channel(MeshSnapshot::default());
        let (event_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            vitals: Arc::new(Mutex::new(DeviceVitals::default())),
            started_at: Instant::now(),
            peers: Arc::new(Mutex::new(Vec::new())),
            snapshot_tx,
            event_tx,
            outgoing: Arc::new(Mutex::new(None)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Watch channel tracking mesh state.
    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// The current mesh state.
    #[must_use]
    pub fn current(&self) -> MeshSnapshot {
        *self.snapshot_tx.borrow()
    }

    /// Subscribes to mesh events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.event_tx.subscribe()
    }

    /// Updates the device health sampled into the next heartbeat.
    pub fn set_vitals(&self, vitals: DeviceVitals) {
        *self.vitals.lock().unwrap() = vitals;
    }

    /// This device's election score right now.
    #[must_use]
    pub fn current_score(&self) -> u32 {
        let vitals = *self.vitals.lock().unwrap();
        election_score(&ScoreInputs {
            device_type: self.config.device_type,
            charging: vitals.charging,
            battery_percent: vitals.battery_percent,
            uptime: self.started_at.elapsed(),
            network_quality: vitals.network_quality,
        })
    }

    /// Whether the client task is running. A session that spent its
    /// reconnect budget counts as stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Connects to the mesh. A no-op when no endpoint is configured or
    /// the client is already running. A client that gave up can be
    /// started again; the attempt budget resets.
    pub fn start(&self) {
        let Some(url) = self.config.mesh_url.clone() else {
            debug!("mesh client not started: no endpoint configured");
            return;
        };
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let session = SessionShared {
            config: self.config.clone(),
            store: self.store.clone(),
            vitals: self.vitals.clone(),
            started_at: self.started_at,
            peers: self.peers.clone(),
            snapshot_tx: self.snapshot_tx.clone(),
            event_tx: self.event_tx.clone(),
            outgoing: self.outgoing.clone(),
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            let mut attempts = 0u32;
            let mut delay = session.config.backoff_base;
            loop {
                let conn = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    conn = connect_async(url.clone()) => conn,
                };
                match conn {
                    Ok((stream, _)) => {
                        info!("mesh session connected to {url}");
                        attempts = 0;
                        delay = session.config.backoff_base;
                        session.run(stream, &mut shutdown_rx).await;
                        session.snapshot_tx.send_modify(|s| s.active = false);
                        let _ = session.event_tx.send(MeshEvent::Disconnected);
                    }
                    Err(e) => {
                        debug!("mesh connect failed: {e}");
                    }
                }
                attempts += 1;
                if attempts >= session.config.max_reconnect_attempts {
                    warn!(
                        attempts,
                        "mesh reconnect budget spent, giving up until restarted"
                    );
                    session.snapshot_tx.send_replace(MeshSnapshot::default());
                    let _ = session.event_tx.send(MeshEvent::GaveUp);
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(session.config.backoff_cap);
            }
        }));
    }

    /// Closes the socket and clears the client's own timers. Other
    /// components are untouched.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        *self.outgoing.lock().unwrap() = None;
        self.snapshot_tx.send_replace(MeshSnapshot::default());
    }

    /// Replicates a locally queued command to the top-ranked peers.
    ///
    /// Opportunistic: with no session, no peers, or on send failure the
    /// command simply stays local and the replay engine remains its
    /// only path out. Never called for commands that themselves arrived
    /// via replication.
    pub fn replicate(&self, command: &QueuedCommand) {
        if command.replicated {
            return;
        }
        let targets = {
            let peers = self.peers.lock().unwrap();
            replication_targets(&peers, self.config.replication_factor)
        };
        if targets.is_empty() {
            debug!(request_id = %command.request_id, "no mesh peers to replicate to");
            return;
        }
        let outgoing = self.outgoing.lock().unwrap();
        let Some(tx) = outgoing.as_ref() else {
            debug!("mesh session not connected, skipping replication");
            return;
        };
        for target in targets {
            let msg = MeshMessage::ReplicateCommand {
                target: target.device_id,
                origin: self.config.device_id,
                command: NewCommand {
                    request_id: command.request_id,
                    action: command.action.clone(),
                    device_id: command.device_id,
                    replicated: true,
                },
            };
            if tx.send(msg).is_err() {
                debug!("mesh session closed mid-replication");
                return;
            }
            debug!(
                request_id = %command.request_id,
                target = %target.device_id,
                "replicating command to peer"
            );
        }
    }
}

impl Drop for MeshClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

/// Everything one mesh session needs, cloneable into the session task.
struct SessionShared {
    config: MeshConfig,
    store: StoreHandle,
    vitals: Arc<Mutex<DeviceVitals>>,
    started_at: Instant,
    peers: Arc<Mutex<Vec<PeerInfo>>>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    event_tx: broadcast::Sender<MeshEvent>,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<MeshMessage>>>>,
}

impl SessionShared {
    fn score(&self) -> u32 {
        let vitals = *self.vitals.lock().unwrap();
        election_score(&ScoreInputs {
            device_type: self.config.device_type,
            charging: vitals.charging,
            battery_percent: vitals.battery_percent,
            uptime: self.started_at.elapsed(),
            network_quality: vitals.network_quality,
        })
    }

    async fn run(&self, stream: WsStream, shutdown_rx: &mut broadcast::Receiver<()>) {
        use futures_util::StreamExt;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        *self.outgoing.lock().unwrap() = Some(out_tx);

        let join = MeshMessage::MeshJoin {
            device_id: self.config.device_id,
            device_name: self.config.device_name.clone(),
            device_type: self.config.device_type,
            score: self.score(),
        };
        if send_message(&mut write, &join).await.is_err() {
            *self.outgoing.lock().unwrap() = None;
            return;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; the join just went out.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = heartbeat.tick() => {
                    let msg = MeshMessage::MeshHeartbeat {
                        device_id: self.config.device_id,
                        score: self.score(),
                    };
                    if send_message(&mut write, &msg).await.is_err() {
                        break;
                    }
                }
                queued = out_rx.recv() => {
                    let Some(msg) = queued else { break };
                    if send_message(&mut write, &msg).await.is_err() {
                        break;
                    }
                }
                incoming = read.next() => {
                    let Some(Ok(msg)) = incoming else {
                        debug!("mesh socket closed");
                        break;
                    };
                    if let Message::Text(text) = msg {
                        self.handle_message(&text).await;
                    }
                }
            }
        }
        *self.outgoing.lock().unwrap() = None;
    }

    async fn handle_message(&self, text: &str) {
        let msg: MeshMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("unparseable mesh message: {e}");
                return;
            }
        };
        match msg {
            MeshMessage::MeshJoined { hub_id } => {
                info!(?hub_id, "joined the device mesh");
                let is_hub = hub_id == Some(self.config.device_id);
                self.snapshot_tx.send_modify(|s| {
                    s.active = true;
                    s.is_hub = is_hub;
                });
                let _ = self.event_tx.send(MeshEvent::Joined);
            }
            MeshMessage::MeshHeartbeatAck => {}
            MeshMessage::PeerListUpdate { peers } => {
                let others: Vec<PeerInfo> = peers
                    .into_iter()
                    .filter(|p| p.device_id != self.config.device_id)
                    .collect();
                let count = others.len();
                *self.peers.lock().unwrap() = others;
                self.snapshot_tx.send_modify(|s| s.peer_count = count);
                debug!(peer_count = count, "mesh peer table replaced");
            }
            MeshMessage::HubElected { device_id } => {
                let is_self = device_id == self.config.device_id;
                info!(hub = %device_id, is_self, "mesh hub elected");
                self.snapshot_tx.send_modify(|s| s.is_hub = is_self);
                self.store
                    .set_meta(HUB_FLAG_KEY, if is_self { "true" } else { "false" })
                    .await;
                let _ = self.event_tx.send(MeshEvent::HubElected { device_id, is_self });
            }
            MeshMessage::ReplicateCommand {
                target,
                origin,
                command,
            } => {
                if target != self.config.device_id {
                    debug!(%target, "ignoring replication addressed to another device");
                    return;
                }
                let request_id = command.request_id;
                // Stored as a replicated copy so it is never re-replicated.
                self.store.add_command(command.replicated()).await;
                debug!(%request_id, %origin, "stored replicated command");
                let ack = MeshMessage::ReplicationAck {
                    request_id,
                    device_id: self.config.device_id,
                };
                if let Some(tx) = self.outgoing.lock().unwrap().as_ref() {
                    let _ = tx.send(ack);
                }
                let _ = self.event_tx.send(MeshEvent::ReplicaStored(request_id));
            }
            MeshMessage::ReplicationAck {
                request_id,
                device_id,
            } => {
                debug!(%request_id, peer = %device_id, "replication acknowledged");
                let _ = self
                    .event_tx
                    .send(MeshEvent::ReplicationAcked { request_id, device_id });
            }
            MeshMessage::SyncAck { request_id } => {
                // The hub pushed this command to the cloud; the local
                // copy is redundant now. Idempotency keys make a race
                // with our own replay harmless.
                if let Some(cmd) = self.store.command_by_request_id(request_id).await {
                    self.store.delete_command(cmd.id).await;
                    debug!(%request_id, "dropped command synced by the hub");
                }
                let _ = self.event_tx.send(MeshEvent::SyncAcked(request_id));
            }
            MeshMessage::MeshJoin { .. } | MeshMessage::MeshHeartbeat { .. } => {
                debug!("ignoring client-to-mesh message echoed back");
            }
        }
    }
}

async fn send_message(write: &mut WsSink, msg: &MeshMessage) -> Result<(), ()> {
    use futures_util::SinkExt;

    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to encode mesh message: {e}");
            return Err(());
        }
    };
    write.send(Message::Text(json)).await.map_err(|e| {
        debug!("mesh send failed, reconnecting: {e}");
    })
}
